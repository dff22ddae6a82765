//! Plugin metadata read from container image labels.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};
use crate::provisioner::WorkloadIdentity;

pub const LABEL_PLUGIN_ID: &str = "waggle.plugin.id";
pub const LABEL_PLUGIN_VERSION: &str = "waggle.plugin.version";
pub const LABEL_PLUGIN_CONFIG: &str = "waggle.plugin.config";
const DEVICES_MARKER: &str = "waggle.devices";
const VOLUMES_MARKER: &str = "waggle.volumes";

pub type Labels = BTreeMap<String, String>;

/// Source of image labels.
#[async_trait]
pub trait ImageInspector: Send + Sync {
    async fn labels(&self, image: &str) -> Result<Labels>;
}

/// Reads labels through the local `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
        }
    }
}

#[async_trait]
impl ImageInspector for DockerCli {
    async fn labels(&self, image: &str) -> Result<Labels> {
        let output = Command::new(&self.program)
            .arg("inspect")
            .arg("--format")
            .arg("{{ json .Config.Labels }}")
            .arg(image)
            .output()
            .await
            .map_err(|e| Error::ImageInspect {
                image: image.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(Error::ImageInspect {
                image: image.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        // Images without labels print `null`.
        let labels: Option<Labels> = serde_json::from_slice(&output.stdout)?;
        Ok(labels.unwrap_or_default())
    }
}

#[derive(Debug, Deserialize)]
struct PluginConfigLabel {
    id: u32,
    version: String,
}

/// Everything the reconciler needs to know about one plugin image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMetadata {
    pub identity: WorkloadIdentity,
    pub devices: Vec<String>,
    pub volumes: Vec<String>,
}

impl ImageMetadata {
    pub fn from_labels(labels: &Labels) -> Result<Self> {
        let identity = match (labels.get(LABEL_PLUGIN_ID), labels.get(LABEL_PLUGIN_VERSION)) {
            (Some(id), Some(version)) => {
                let id = id.trim().parse().map_err(|_| Error::InvalidLabel {
                    label: LABEL_PLUGIN_ID,
                    value: id.clone(),
                })?;
                WorkloadIdentity::new(id, non_empty(LABEL_PLUGIN_VERSION, version)?)
            }
            _ => Self::identity_from_config(labels)?,
        };

        Ok(Self {
            identity,
            devices: collect_paths(labels, DEVICES_MARKER),
            volumes: collect_paths(labels, VOLUMES_MARKER),
        })
    }

    fn identity_from_config(labels: &Labels) -> Result<WorkloadIdentity> {
        let Some(raw) = labels.get(LABEL_PLUGIN_CONFIG) else {
            return Err(Error::MissingLabel(if labels.contains_key(LABEL_PLUGIN_ID) {
                LABEL_PLUGIN_VERSION
            } else {
                LABEL_PLUGIN_ID
            }));
        };
        let config: PluginConfigLabel =
            serde_json::from_str(raw).map_err(|_| Error::InvalidLabel {
                label: LABEL_PLUGIN_CONFIG,
                value: raw.clone(),
            })?;
        debug!("Using {} label for plugin {}", LABEL_PLUGIN_CONFIG, config.id);
        Ok(WorkloadIdentity::new(
            config.id,
            non_empty(LABEL_PLUGIN_CONFIG, &config.version)?,
        ))
    }

    /// Devices passed through at the same path inside the container.
    pub fn device_mappings(&self) -> Vec<String> {
        same_path(&self.devices)
    }

    /// Host paths bind-mounted at the same location.
    pub fn volume_mounts(&self) -> Vec<String> {
        same_path(&self.volumes)
    }
}

fn same_path(paths: &[String]) -> Vec<String> {
    paths.iter().map(|p| format!("{p}:{p}")).collect()
}

fn non_empty(label: &'static str, value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::InvalidLabel {
            label,
            value: value.to_string(),
        });
    }
    Ok(value.to_string())
}

fn collect_paths(labels: &Labels, marker: &str) -> Vec<String> {
    labels
        .iter()
        .filter(|(key, _)| key.contains(marker))
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}
