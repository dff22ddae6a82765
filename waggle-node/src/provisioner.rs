//! Per-plugin broker identity: user, permissions, queue and binding.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rabbitmq_api::{Permissions, QueueDeclaration, RabbitMqApi, password_hash};
use rand::RngCore;
use tracing::{debug, info};

use crate::config::{NodeEnv, PluginsConfig, RoutingKeyStyle};
use crate::error::{Error, Result};

/// Identity of one running plugin instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadIdentity {
    pub plugin_id: u32,
    pub plugin_version: String,
    pub instance: u32,
}

impl WorkloadIdentity {
    /// Every workload currently runs as instance 0, so the same image
    /// cannot run twice concurrently.
    pub fn new(plugin_id: u32, plugin_version: impl Into<String>) -> Self {
        Self {
            plugin_id,
            plugin_version: plugin_version.into(),
            instance: 0,
        }
    }

    pub fn username(&self) -> String {
        format!(
            "plugin-{}-{}-{}",
            self.plugin_id, self.plugin_version, self.instance
        )
    }

    pub fn queue_name(&self) -> String {
        format!("to-{}", self.username())
    }

    pub fn routing_key(&self, node: &NodeEnv, style: RoutingKeyStyle) -> String {
        match style {
            RoutingKeyStyle::Hierarchy => format!(
                "{}.{}.{}.{}.{}",
                node.node_id, node.sub_id, self.plugin_id, self.plugin_version, self.instance
            ),
            RoutingKeyStyle::Tagged => format!(
                "{}.{}.plugin.{}.{}.{}",
                node.node_id, node.sub_id, self.plugin_id, self.plugin_version, self.instance
            ),
        }
    }
}

/// Credentials issued to a provisioned plugin. The password is handed to
/// the plugin's environment and not persisted here.
#[derive(Clone)]
pub struct ProvisionedWorkload {
    pub identity: WorkloadIdentity,
    pub username: String,
    pub queue: String,
    pub password: String,
}

impl std::fmt::Debug for ProvisionedWorkload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionedWorkload")
            .field("identity", &self.identity)
            .field("username", &self.username)
            .field("queue", &self.queue)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserChange {
    Unchanged,
    Updated,
}

/// 20 random bytes, hex encoded.
pub fn generate_password() -> String {
    let mut bytes = [0u8; 20];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Permission regexes: plugins read only their own queue and write only
/// into the shared publish exchanges. They cannot configure anything; the
/// queue and its binding are owned by the provisioner.
pub fn permissions_for(queue: &str, publish_exchanges: &[String]) -> Permissions {
    let exchanges: Vec<String> = publish_exchanges
        .iter()
        .map(|e| regex::escape(e))
        .collect();
    Permissions {
        configure: "^$".to_string(),
        write: format!("^({})$", exchanges.join("|")),
        read: format!("^{}$", regex::escape(queue)),
    }
}

/// Stores plugin passwords so repeated passes reuse them.
///
/// Layout: `{dir}/{username}/plugin.credentials`
/// ```text
/// [credentials]
/// username=plugin-37-0.1.0-0
/// password=...
/// ```
#[derive(Debug, Clone)]
pub struct PasswordCache {
    dir: PathBuf,
}

impl PasswordCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, username: &str) -> PathBuf {
        self.dir.join(username).join("plugin.credentials")
    }

    pub fn load(&self, username: &str) -> Result<Option<String>> {
        let path = self.path(username);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .filter_map(|line| line.trim().strip_prefix("password="))
            .map(str::to_string)
            .find(|p| !p.is_empty()))
    }

    pub fn store(&self, username: &str, password: &str) -> Result<()> {
        let path = self.path(username);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = format!("[credentials]\nusername={username}\npassword={password}\n");
        write_private(&path, content.as_bytes())?;
        debug!("Stored credentials for {} in {}", username, path.display());
        Ok(())
    }
}

fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(data)?;
    }

    #[cfg(not(unix))]
    std::fs::write(path, data)?;

    Ok(())
}

/// Establishes the broker user, permissions, queue and binding for plugins.
pub struct PluginProvisioner {
    api: Arc<RabbitMqApi>,
    node: NodeEnv,
    settings: PluginsConfig,
    cache: Option<PasswordCache>,
}

impl PluginProvisioner {
    pub fn new(api: Arc<RabbitMqApi>, node: NodeEnv, settings: PluginsConfig) -> Self {
        let cache = settings.password_cache_dir.clone().map(PasswordCache::new);
        Self {
            api,
            node,
            settings,
            cache,
        }
    }

    pub fn settings(&self) -> &PluginsConfig {
        &self.settings
    }

    /// Bring the broker in line with what `identity` may use.
    pub async fn provision(&self, identity: &WorkloadIdentity) -> Result<ProvisionedWorkload> {
        let username = identity.username();
        let queue = identity.queue_name();
        let password = self.password_for(&username)?;

        let change = self.reconcile_user(&username, &password).await?;
        debug!("User {}: {:?}", username, change);

        self.reconcile_permissions(&username, &queue).await?;
        self.reconcile_queue(&queue).await?;

        let routing_key = identity.routing_key(&self.node, self.settings.routing_key_style);
        self.reconcile_binding(&queue, &routing_key).await?;

        info!(
            "Provisioned {} (queue {}, routing key {})",
            username, queue, routing_key
        );

        Ok(ProvisionedWorkload {
            identity: identity.clone(),
            username,
            queue,
            password,
        })
    }

    fn password_for(&self, username: &str) -> Result<String> {
        let Some(cache) = &self.cache else {
            return Ok(generate_password());
        };
        if let Some(password) = cache.load(username)? {
            return Ok(password);
        }
        let password = generate_password();
        cache.store(username, &password)?;
        Ok(password)
    }

    /// Update the user only if its stored hash differs from `password`'s.
    pub async fn reconcile_user(&self, username: &str, password: &str) -> Result<UserChange> {
        let target = password_hash(password);

        if let Some(user) = self.api.get_user(username).await?
            && user.password_hash == target
        {
            return Ok(UserChange::Unchanged);
        }

        self.api.put_user(username, &target).await?;
        Ok(UserChange::Updated)
    }

    pub async fn reconcile_permissions(&self, username: &str, queue: &str) -> Result<()> {
        let permissions = permissions_for(queue, &self.settings.publish_exchanges);
        self.api.put_permissions(username, &permissions).await?;
        Ok(())
    }

    /// Declare the plugin's durable queue. A conflicting existing queue is
    /// an error for this plugin.
    pub async fn reconcile_queue(&self, queue: &str) -> Result<()> {
        self.api
            .put_queue(queue, &QueueDeclaration::durable())
            .await
            .map_err(Error::from)
    }

    pub async fn reconcile_binding(&self, queue: &str, routing_key: &str) -> Result<()> {
        self.api
            .create_binding(&self.settings.to_node_exchange, queue, routing_key)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn node() -> NodeEnv {
        NodeEnv {
            node_id: "000000000001".into(),
            sub_id: "0000000000000000".into(),
            beehive_host: "beehive".into(),
        }
    }

    fn provisioner(server: &MockServer, settings: PluginsConfig) -> PluginProvisioner {
        let api = Arc::new(RabbitMqApi::new("admin", "admin", server.uri()).unwrap());
        PluginProvisioner::new(api, node(), settings)
    }

    #[test]
    fn test_identity_names() {
        let identity = WorkloadIdentity::new(37, "0.1.0");
        assert_eq!(identity.username(), "plugin-37-0.1.0-0");
        assert_eq!(identity.queue_name(), "to-plugin-37-0.1.0-0");
        assert_eq!(identity.username(), WorkloadIdentity::new(37, "0.1.0").username());
    }

    #[test]
    fn test_username_varies_with_each_input() {
        let base = WorkloadIdentity::new(37, "0.1.0");
        let other_id = WorkloadIdentity::new(38, "0.1.0");
        let other_version = WorkloadIdentity::new(37, "0.1.1");
        let other_instance = WorkloadIdentity {
            instance: 1,
            ..base.clone()
        };
        assert_ne!(base.username(), other_id.username());
        assert_ne!(base.username(), other_version.username());
        assert_ne!(base.username(), other_instance.username());
    }

    #[test]
    fn test_routing_keys() {
        let identity = WorkloadIdentity::new(37, "0.1.0");
        assert_eq!(
            identity.routing_key(&node(), RoutingKeyStyle::Hierarchy),
            "000000000001.0000000000000000.37.0.1.0.0"
        );
        assert_eq!(
            identity.routing_key(&node(), RoutingKeyStyle::Tagged),
            "000000000001.0000000000000000.plugin.37.0.1.0.0"
        );
    }

    #[test]
    fn test_permissions_scope() {
        let perms = permissions_for(
            "to-plugin-37-0.1.0-0",
            &["messages".to_string(), "data".to_string()],
        );
        assert_eq!(perms.configure, "^$");
        assert_eq!(perms.read, r"^to\-plugin\-37\-0\.1\.0\-0$");
        assert_eq!(perms.write, "^(messages|data)$");

        let configure = regex::Regex::new(&perms.configure).unwrap();
        assert!(!configure.is_match("to-plugin-37-0.1.0-0"));

        let read = regex::Regex::new(&perms.read).unwrap();
        assert!(read.is_match("to-plugin-37-0.1.0-0"));
        assert!(!read.is_match("to-plugin-37-0x1x0-0"));
        assert!(!read.is_match("to-plugin-37-0.1.0-01"));

        let write = regex::Regex::new(&perms.write).unwrap();
        assert!(write.is_match("messages"));
        assert!(write.is_match("data"));
        assert!(!write.is_match("data-pipeline-in"));
        assert!(!write.is_match("to-node"));
    }

    #[test]
    fn test_generate_password() {
        let a = generate_password();
        assert_eq!(a.len(), 40);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, generate_password());
    }

    #[test]
    fn test_password_cache_roundtrip() {
        let dir = TempDir::new().unwrap();
        let cache = PasswordCache::new(dir.path());
        assert_eq!(cache.load("plugin-1-1.0-0").unwrap(), None);
        cache.store("plugin-1-1.0-0", "secret").unwrap();
        assert_eq!(cache.load("plugin-1-1.0-0").unwrap().as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn test_reconcile_user_skips_matching_hash() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/users/plugin-37-0.1.0-0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "plugin-37-0.1.0-0",
                "password_hash": password_hash("test12"),
                "hashing_algorithm": "rabbit_password_hashing_sha256",
                "tags": [],
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&server)
            .await;

        let change = provisioner(&server, PluginsConfig::default())
            .reconcile_user("plugin-37-0.1.0-0", "test12")
            .await
            .unwrap();
        assert_eq!(change, UserChange::Unchanged);
    }

    #[tokio::test]
    async fn test_reconcile_user_creates_missing_user() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/users/plugin-37-0.1.0-0"))
            .and(body_json(serde_json::json!({
                "password_hash": "kI3GCqW5JLMJa4iX1lo7X4D6XbYqlLgxIs30+P6tENUV2POR",
                "tags": "",
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let change = provisioner(&server, PluginsConfig::default())
            .reconcile_user("plugin-37-0.1.0-0", "test12")
            .await
            .unwrap();
        assert_eq!(change, UserChange::Updated);
    }

    async fn mount_topology(server: &MockServer, passes: u64) {
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/users/plugin-37-0.1.0-0"))
            .respond_with(ResponseTemplate::new(201))
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/permissions/%2f/plugin-37-0.1.0-0"))
            .and(body_json(serde_json::json!({
                "configure": "^$",
                "write": "^(messages|data)$",
                "read": r"^to\-plugin\-37\-0\.1\.0\-0$",
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(passes)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_provision_full_topology() {
        let server = MockServer::start().await;
        mount_topology(&server, 1).await;
        Mock::given(method("PUT"))
            .and(path("/api/queues/%2f/to-plugin-37-0.1.0-0"))
            .and(body_json(serde_json::json!({ "durable": true, "auto_delete": false })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/bindings/%2f/e/to-node/q/to-plugin-37-0.1.0-0"))
            .and(body_json(serde_json::json!({
                "routing_key": "000000000001.0000000000000000.37.0.1.0.0",
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let workload = provisioner(&server, PluginsConfig::default())
            .provision(&WorkloadIdentity::new(37, "0.1.0"))
            .await
            .unwrap();
        assert_eq!(workload.username, "plugin-37-0.1.0-0");
        assert_eq!(workload.queue, "to-plugin-37-0.1.0-0");
        assert_eq!(workload.password.len(), 40);
    }

    #[tokio::test]
    async fn test_provision_queue_conflict_surfaces() {
        let server = MockServer::start().await;
        mount_topology(&server, 1).await;
        Mock::given(method("PUT"))
            .and(path("/api/queues/%2f/to-plugin-37-0.1.0-0"))
            .respond_with(ResponseTemplate::new(400).set_body_string("inequivalent arg 'durable'"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let err = provisioner(&server, PluginsConfig::default())
            .provision(&WorkloadIdentity::new(37, "0.1.0"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_cached_password_is_reused() {
        let server = MockServer::start().await;
        mount_topology(&server, 2).await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let settings = PluginsConfig {
            password_cache_dir: Some(dir.path().to_path_buf()),
            ..PluginsConfig::default()
        };
        let provisioner = provisioner(&server, settings);
        let identity = WorkloadIdentity::new(37, "0.1.0");

        let first = provisioner.provision(&identity).await.unwrap();
        let second = provisioner.provision(&identity).await.unwrap();
        assert_eq!(first.password, second.password);
        assert!(dir.path().join("plugin-37-0.1.0-0/plugin.credentials").exists());
    }
}
