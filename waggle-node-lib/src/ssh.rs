//! SSH command execution against the beehive registration server.
//!
//! Authenticates with the node's pre-shared registration key using russh.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use russh::ChannelMsg;
use russh::client::{self, Config, Handle, Handler};
use russh::keys::PrivateKey;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::ssh_key::PublicKey;
use tracing::debug;

use crate::{Error, Result};

/// Connection settings for the beehive registration SSH server.
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Pre-shared registration key
    pub key_path: PathBuf,
    pub timeout: Duration,
}

/// Client handler for russh.
struct SshHandler;

impl Handler for SshHandler {
    type Error = russh::Error;

    fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> impl std::future::Future<Output = std::result::Result<bool, Self::Error>> + Send {
        // Registration happens before the node has any trust material for the beehive
        async { Ok(true) }
    }
}

fn load_key(path: &Path) -> Result<PrivateKey> {
    let key_data = std::fs::read_to_string(path)
        .map_err(|e| Error::Ssh(format!("Failed to read key {}: {}", path.display(), e)))?;
    russh::keys::decode_secret_key(&key_data, None)
        .map_err(|e| Error::Ssh(format!("Failed to parse key {}: {}", path.display(), e)))
}

async fn connect(config: &SshConfig) -> Result<Handle<SshHandler>> {
    let addr = (config.host.as_str(), config.port);
    debug!("Connecting to SSH at {}:{}", config.host, config.port);

    let timeout_result = tokio::time::timeout(
        config.timeout,
        client::connect(Arc::new(Config::default()), addr, SshHandler),
    )
    .await;

    let mut session = match timeout_result {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return Err(Error::Ssh(format!("Failed to connect: {}", e))),
        Err(_) => return Err(Error::Timeout("SSH connection")),
    };

    let key = load_key(&config.key_path)?;
    let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
    let auth_result = session
        .authenticate_publickey(&config.username, key_with_hash)
        .await
        .map_err(|e| Error::Ssh(format!("Key auth failed: {}", e)))?;

    if auth_result.success() {
        debug!("SSH authentication successful");
        Ok(session)
    } else {
        Err(Error::Ssh("Authentication failed".to_string()))
    }
}

/// Execute a command on the registration server and return its stdout.
pub async fn ssh_exec(config: &SshConfig, command: &str) -> Result<String> {
    let session = connect(config).await?;

    debug!("SSH exec on {}: {}", config.host, command);

    let mut channel = session
        .channel_open_session()
        .await
        .map_err(|e| Error::Ssh(format!("Failed to open channel: {}", e)))?;

    channel
        .exec(true, command)
        .await
        .map_err(|e| Error::Ssh(format!("Failed to exec command: {}", e)))?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_status = None;

    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
            Some(ChannelMsg::ExtendedData { data, ext }) => {
                if ext == 1 {
                    stderr.extend_from_slice(&data);
                }
            }
            Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                exit_status = Some(status);
            }
            // exit-status can follow EOF, so only stop on close
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }

    let exit_code = exit_status.unwrap_or(0);
    if exit_code == 0 {
        Ok(String::from_utf8_lossy(&stdout).to_string())
    } else {
        Err(Error::Ssh(format!(
            "command {:?} failed: {} (exit code: {})",
            command,
            String::from_utf8_lossy(&stderr).trim(),
            exit_code
        )))
    }
}
