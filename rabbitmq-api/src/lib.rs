//! Client for the RabbitMQ management HTTP API.
//!
//! Covers the subset a node needs to manage its own topology: users,
//! permissions, queues, bindings and dynamic shovel parameters.

use base64::{Engine, engine::general_purpose::STANDARD};
use reqwest::{Client, IntoUrl, Method, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Debug;
use std::time::Duration;
use tracing::{debug, error};

/// Salt used for generated password hashes. Fixed so a given password
/// always hashes to the same value and unchanged users can be skipped.
const PASSWORD_SALT: [u8; 4] = [0x90, 0x8d, 0xc6, 0x0a];

/// Default virtual host, percent-encoded.
const DEFAULT_VHOST: &str = "%2f";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error within reqwest library (includes connection failures)
    #[error("RabbitMQ API request failed: {0}")]
    ReqwestError(#[from] reqwest::Error),

    /// Error returned by server
    #[error("HTTP error from API: {0}")]
    HttpError(StatusCode),

    /// Declaration rejected because it conflicts with existing state
    #[error("{resource} conflicts with existing broker state ({status}): {body}")]
    Conflict {
        resource: String,
        status: StatusCode,
        body: String,
    },

    /// Status outside the set accepted for this call
    #[error("unexpected status {status} for {resource}: {body}")]
    UnexpectedStatus {
        resource: String,
        status: StatusCode,
        body: String,
    },
}

impl Error {
    /// True if the broker could not be reached at all.
    pub fn is_connect(&self) -> bool {
        matches!(self, Error::ReqwestError(e) if e.is_connect() || e.is_timeout())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Compute the broker's `rabbit_password_hashing_sha256` hash:
/// `base64(salt ++ sha256(salt ++ password))`.
pub fn password_hash(password: &str) -> String {
    password_hash_with_salt(PASSWORD_SALT, password)
}

pub fn password_hash_with_salt(salt: [u8; 4], password: &str) -> String {
    let digest = Sha256::new()
        .chain_update(salt)
        .chain_update(password.as_bytes())
        .finalize();
    let mut data = Vec::with_capacity(salt.len() + digest.len());
    data.extend_from_slice(&salt);
    data.extend_from_slice(&digest);
    STANDARD.encode(data)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    #[serde(default)]
    pub password_hash: String,
    #[serde(default)]
    pub hashing_algorithm: Option<String>,
}

#[derive(Debug, Serialize)]
struct PutUser<'a> {
    password_hash: &'a str,
    tags: &'a str,
}

/// Regexes scoping what a user may configure, write and read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub configure: String,
    pub write: String,
    pub read: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueDeclaration {
    pub durable: bool,
    pub auto_delete: bool,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

impl QueueDeclaration {
    pub fn durable() -> Self {
        Self {
            durable: true,
            auto_delete: false,
            arguments: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Serialize)]
struct PostBinding<'a> {
    routing_key: &'a str,
}

#[derive(Debug, Serialize)]
struct ParameterValue<'a, T: Serialize> {
    value: &'a T,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    #[serde(default)]
    pub messages: Option<u64>,
    #[serde(default)]
    pub consumers: Option<u64>,
}

/// Runtime state of a shovel as reported by `GET /api/shovels`.
#[derive(Debug, Clone, Deserialize)]
pub struct ShovelStatus {
    pub name: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(rename = "type", default)]
    pub shovel_type: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

pub struct RabbitMqApi {
    client: Client,
    username: String,
    password: String,
    base_url: Url,
}

impl Debug for RabbitMqApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RabbitMqApi")
            .field("username", &self.username)
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

impl RabbitMqApi {
    pub fn new<U: ToString, P: ToString, T: IntoUrl>(
        username: U,
        password: P,
        base_url: T,
    ) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        let mut base_url = base_url.into_url()?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            client,
            username: username.to_string(),
            password: password.to_string(),
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        url.set_path(&format!("{}api/{}", self.base_url.path(), path));
        url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = self.url(path);
        debug!("{} {}", method, url);
        self.client
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
    }

    /// Hit the API root. Any HTTP response counts, including error statuses;
    /// only a transport failure is an error.
    pub async fn probe(&self) -> Result<StatusCode> {
        let resp = self.request(Method::GET, "").send().await?;
        Ok(resp.status())
    }

    pub async fn get_user(&self, name: &str) -> Result<Option<User>> {
        let resp = self
            .request(Method::GET, &format!("users/{}", urlencoding::encode(name)))
            .send()
            .await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            Ok(None)
        } else if status.is_success() {
            Ok(Some(resp.json().await?))
        } else {
            error!("Failed to get user {name}: {status}");
            Err(Error::HttpError(status))
        }
    }

    /// Create or update a user with a precomputed password hash and no tags.
    pub async fn put_user(&self, name: &str, password_hash: &str) -> Result<()> {
        let body = PutUser {
            password_hash,
            tags: "",
        };
        let resp = self
            .request(Method::PUT, &format!("users/{}", urlencoding::encode(name)))
            .json(&body)
            .send()
            .await?;
        expect_status(resp, &format!("user {name}"), &[StatusCode::CREATED, StatusCode::NO_CONTENT])
            .await
    }

    pub async fn put_permissions(&self, user: &str, permissions: &Permissions) -> Result<()> {
        let resp = self
            .request(
                Method::PUT,
                &format!("permissions/{DEFAULT_VHOST}/{}", urlencoding::encode(user)),
            )
            .json(permissions)
            .send()
            .await?;
        expect_status(
            resp,
            &format!("permissions for {user}"),
            &[StatusCode::CREATED, StatusCode::NO_CONTENT],
        )
        .await
    }

    /// Declare a queue. Redeclaring with identical properties succeeds;
    /// incompatible properties yield [`Error::Conflict`].
    pub async fn put_queue(&self, name: &str, declaration: &QueueDeclaration) -> Result<()> {
        let resp = self
            .request(
                Method::PUT,
                &format!("queues/{DEFAULT_VHOST}/{}", urlencoding::encode(name)),
            )
            .json(declaration)
            .send()
            .await?;
        expect_status(
            resp,
            &format!("queue {name}"),
            &[StatusCode::CREATED, StatusCode::NO_CONTENT],
        )
        .await
    }

    /// Bind `queue` to `exchange`. The API answers 201 for a new binding
    /// and 204 for one that already exists.
    pub async fn create_binding(
        &self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
    ) -> Result<()> {
        let resp = self
            .request(
                Method::POST,
                &format!(
                    "bindings/{DEFAULT_VHOST}/e/{}/q/{}",
                    urlencoding::encode(exchange),
                    urlencoding::encode(queue)
                ),
            )
            .json(&PostBinding { routing_key })
            .send()
            .await?;
        expect_status(
            resp,
            &format!("binding {exchange} -> {queue} ({routing_key})"),
            &[StatusCode::CREATED, StatusCode::NO_CONTENT],
        )
        .await
    }

    /// Create or replace a dynamic shovel parameter.
    pub async fn put_shovel<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let resp = self
            .request(
                Method::PUT,
                &format!("parameters/shovel/{DEFAULT_VHOST}/{}", urlencoding::encode(name)),
            )
            .json(&ParameterValue { value })
            .send()
            .await?;
        expect_status(
            resp,
            &format!("shovel {name}"),
            &[StatusCode::CREATED, StatusCode::NO_CONTENT],
        )
        .await
    }

    /// Delete a dynamic shovel parameter. Returns `false` if it did not exist.
    pub async fn delete_shovel(&self, name: &str) -> Result<bool> {
        let resp = self
            .request(
                Method::DELETE,
                &format!("parameters/shovel/{DEFAULT_VHOST}/{}", urlencoding::encode(name)),
            )
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        expect_status(
            resp,
            &format!("shovel {name}"),
            &[StatusCode::OK, StatusCode::NO_CONTENT],
        )
        .await?;
        Ok(true)
    }

    pub async fn list_shovels(&self) -> Result<Vec<ShovelStatus>> {
        let resp = self.request(Method::GET, "shovels").send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(resp.json().await?)
        } else {
            error!("Failed to list shovels: {status}");
            Err(Error::HttpError(status))
        }
    }

    pub async fn list_queues(&self) -> Result<Vec<QueueInfo>> {
        let resp = self
            .request(Method::GET, &format!("queues/{DEFAULT_VHOST}"))
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            Ok(resp.json().await?)
        } else {
            error!("Failed to list queues: {status}");
            Err(Error::HttpError(status))
        }
    }
}

async fn expect_status(resp: Response, resource: &str, accepted: &[StatusCode]) -> Result<()> {
    let status = resp.status();
    if accepted.contains(&status) {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    error!("Failed to apply {resource}: {status} - {body}");
    let resource = resource.to_string();
    match status {
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT => Err(Error::Conflict {
            resource,
            status,
            body,
        }),
        _ => Err(Error::UnexpectedStatus {
            resource,
            status,
            body,
        }),
    }
}
