//! Execution layer: converges running containers to a desired service set.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info};
use waggle_node_lib::CredentialStore;

use crate::config::ExecutionConfig;
use crate::error::{Error, Result};

/// One plugin container as the execution layer should run it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub environment: BTreeMap<String, String>,
    /// Host devices passed through as `host:container`
    pub devices: Vec<String>,
    pub volumes: Vec<String>,
}

/// The complete set of plugin services that should be running.
/// Anything not listed is an orphan and gets removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    pub services: Vec<ServiceSpec>,
}

impl DesiredState {
    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.iter().map(|s| s.name.as_str())
    }
}

#[async_trait]
pub trait ExecutionLayer: Send + Sync {
    /// Run exactly the services in `state`.
    async fn converge(&self, state: &DesiredState) -> Result<()>;

    /// Stop everything, including base services.
    async fn teardown(&self) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct ComposeFile<'a> {
    version: &'static str,
    services: BTreeMap<&'a str, ComposeService<'a>>,
}

#[derive(Debug, Serialize)]
struct ComposeService<'a> {
    image: &'a str,
    restart: &'static str,
    networks: [&'a str; 1],
    env_file: [&'a str; 1],
    environment: Vec<String>,
    #[serde(skip_serializing_if = "no_entries")]
    devices: &'a [String],
    volumes: &'a [String],
}

fn no_entries(list: &&[String]) -> bool {
    list.is_empty()
}

/// Drives `docker-compose` with a generated plugins file layered over the
/// node's base compose files.
#[derive(Debug, Clone)]
pub struct DockerCompose {
    settings: ExecutionConfig,
    program: String,
}

impl DockerCompose {
    pub fn new(settings: ExecutionConfig) -> Self {
        Self {
            settings,
            program: "docker-compose".to_string(),
        }
    }

    /// Render the plugins compose document.
    pub fn render(&self, state: &DesiredState) -> Result<String> {
        let services = state
            .services
            .iter()
            .map(|service| {
                let compose = ComposeService {
                    image: &service.image,
                    restart: "always",
                    networks: [self.settings.network.as_str()],
                    env_file: [self.settings.env_file.as_str()],
                    environment: service
                        .environment
                        .iter()
                        .map(|(k, v)| format!("{k}={v}"))
                        .collect(),
                    devices: &service.devices,
                    volumes: &service.volumes,
                };
                (service.name.as_str(), compose)
            })
            .collect();

        let file = ComposeFile {
            version: "3",
            services,
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    fn base_args(&self, with_plugins: bool) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(project) = &self.settings.project_name {
            args.push("-p".to_string());
            args.push(project.clone());
        }
        let plugins = with_plugins.then_some(&self.settings.plugins_file);
        for file in self.settings.compose_files.iter().chain(plugins) {
            args.push("-f".to_string());
            args.push(file.display().to_string());
        }
        args
    }

    /// Arguments for `up`, exposed for inspection.
    pub fn up_args(&self) -> Vec<String> {
        let mut args = self.base_args(true);
        args.extend(["up", "-d", "--remove-orphans"].map(String::from));
        args
    }

    pub fn down_args(&self) -> Vec<String> {
        let mut args = self.base_args(false);
        args.extend(["down", "--remove-orphans"].map(String::from));
        args
    }

    async fn run(&self, args: &[String]) -> Result<()> {
        debug!("Running {} {}", self.program, args.join(" "));
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Execution(format!("failed to run {}: {e}", self.program)))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Execution(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

fn write_plugins_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

#[async_trait]
impl ExecutionLayer for DockerCompose {
    async fn converge(&self, state: &DesiredState) -> Result<()> {
        let content = self.render(state)?;
        write_plugins_file(&self.settings.plugins_file, &content)?;
        info!(
            "Wrote {} plugin services to {}",
            state.services.len(),
            self.settings.plugins_file.display()
        );
        self.run(&self.up_args()).await
    }

    async fn teardown(&self) -> Result<()> {
        info!("Stopping node services");
        self.run(&self.down_args()).await
    }
}

/// Stop node services, then remove the credential bundle. Credentials are
/// left in place if the services could not be stopped.
pub async fn shut_down_node(layer: &dyn ExecutionLayer, store: &CredentialStore) -> Result<()> {
    layer.teardown().await?;
    store.clear()?;
    info!("Removed credentials from {}", store.base_dir().display());
    Ok(())
}
