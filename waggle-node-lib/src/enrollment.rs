use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::pem::{self, BlockPolicy};
use crate::ssh::{SshConfig, ssh_exec};
use crate::{CredentialStore, Error, IdentityBundle, Result};

/// Beehive cert server reachable over plain HTTP (local or bridged).
#[derive(Debug, Clone)]
pub struct LocalCertServer {
    client: reqwest::Client,
    base_url: String,
}

impl LocalCertServer {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        Self::with_base_url(format!("http://{host}:{port}"))
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get_text(&self, path_and_query: &str) -> Result<String> {
        let url = format!("{}/{}", self.base_url, path_and_query);
        debug!("GET {}", url);
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::HttpStatus { status, url });
        }
        Ok(resp.text().await?)
    }
}

/// Beehive cert server reached by running commands over SSH with the
/// node's registration key.
#[derive(Debug, Clone)]
pub struct SshCertServer {
    config: SshConfig,
}

impl SshCertServer {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }
}

/// How the node talks to the beehive certificate authority.
#[derive(Debug, Clone)]
pub enum EnrollmentTransport {
    LocalCertServer(LocalCertServer),
    SshCertServer(SshCertServer),
}

impl EnrollmentTransport {
    /// Use SSH when the registration key is present, otherwise fall back
    /// to the local cert server.
    pub fn select(local: LocalCertServer, ssh: SshConfig) -> Self {
        if ssh.key_path.exists() {
            info!(
                "Registration key {} exists, registering over SSH",
                ssh.key_path.display()
            );
            Self::SshCertServer(SshCertServer::new(ssh))
        } else {
            warn!(
                "Registration key {} does not exist, falling back to local cert server",
                ssh.key_path.display()
            );
            Self::LocalCertServer(local)
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::LocalCertServer(_) => "local cert server",
            Self::SshCertServer(_) => "ssh cert server",
        }
    }

    async fn fetch_ca_blob(&self) -> Result<String> {
        match self {
            Self::LocalCertServer(server) => server.get_text("certca").await,
            Self::SshCertServer(server) => ssh_exec(&server.config, "certca").await,
        }
    }

    async fn fetch_credentials_blob(&self, node_id: &str) -> Result<String> {
        let request = format!("node?{node_id}");
        match self {
            Self::LocalCertServer(server) => server.get_text(&request).await,
            Self::SshCertServer(server) => ssh_exec(&server.config, &request).await,
        }
    }
}

/// Extract the identity bundle from the two cert server payloads.
pub fn parse_bundle(ca_blob: &str, credentials: &str, policy: BlockPolicy) -> Result<IdentityBundle> {
    let ca_certificate = pem::scan_certificate(ca_blob, policy)
        .ok_or_else(|| Error::malformed("CA certificate", "certca response"))?;
    let node_certificate = pem::scan_certificate(credentials, policy)
        .ok_or_else(|| Error::malformed("node certificate", "node credentials response"))?;
    let node_key = pem::scan_rsa_key(credentials, policy)
        .ok_or_else(|| Error::malformed("RSA private key", "node credentials response"))?;
    let reverse_tunnel_port = pem::scan_port(credentials)
        .ok_or_else(|| Error::malformed("PORT=<n> token", "node credentials response"))?;

    Ok(IdentityBundle {
        ca_certificate: ca_certificate.to_string(),
        node_certificate: node_certificate.to_string(),
        node_key: node_key.to_string(),
        reverse_tunnel_port,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentOutcome {
    AlreadyEnrolled,
    Enrolled { reverse_tunnel_port: u16 },
}

/// Obtains the node's identity bundle from the beehive when it is missing.
#[derive(Debug, Clone)]
pub struct EnrollmentClient {
    store: CredentialStore,
    transport: EnrollmentTransport,
    node_id: String,
    policy: BlockPolicy,
}

impl EnrollmentClient {
    pub fn new(
        store: CredentialStore,
        transport: EnrollmentTransport,
        node_id: impl Into<String>,
        policy: BlockPolicy,
    ) -> Self {
        Self {
            store,
            transport,
            node_id: node_id.into(),
            policy,
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Enroll once if no bundle is stored.
    ///
    /// A single attempt never retries; failures are left to the caller's
    /// schedule. Nothing is written unless every field was recovered.
    pub async fn ensure_enrolled(&self) -> Result<EnrollmentOutcome> {
        if self.store.exists() {
            debug!("Credentials already present in {:?}", self.store.base_dir());
            return Ok(EnrollmentOutcome::AlreadyEnrolled);
        }

        info!(
            "Registering node {} via {}",
            self.node_id,
            self.transport.name()
        );

        let ca_blob = self.transport.fetch_ca_blob().await?;
        debug!("Got CA certificate response ({} bytes)", ca_blob.len());

        let credentials = self.transport.fetch_credentials_blob(&self.node_id).await?;
        debug!("Got credentials response ({} bytes)", credentials.len());

        let bundle = parse_bundle(&ca_blob, &credentials, self.policy)?;
        self.store.write(&bundle)?;

        info!(
            "Registered node {}, reverse tunnel port {}",
            self.node_id, bundle.reverse_tunnel_port
        );
        Ok(EnrollmentOutcome::Enrolled {
            reverse_tunnel_port: bundle.reverse_tunnel_port,
        })
    }
}

/// Call `ensure_enrolled` every `interval` until `cancel` fires.
///
/// Failures are logged and deferred to the next attempt; the loop itself
/// never fails.
pub async fn run_enrollment_loop(
    client: &EnrollmentClient,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!("Starting enrollment loop (interval {:?})", interval);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match client.ensure_enrolled().await {
            Ok(EnrollmentOutcome::AlreadyEnrolled) => {
                debug!("Already has credentials, will not re-register");
            }
            Ok(EnrollmentOutcome::Enrolled { .. }) => {}
            Err(e) if e.is_transient() => {
                warn!("Registration attempt failed, retrying in {:?}: {}", interval, e);
            }
            Err(e) => {
                error!("Registration attempt failed, retrying in {:?}: {}", interval, e);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!("Enrollment loop stopped");
}
