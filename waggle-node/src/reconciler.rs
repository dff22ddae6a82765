//! Desired-state pass over the plugin set.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::error::{BatchReport, Error, Result};
use crate::execution::{DesiredState, ExecutionLayer, ServiceSpec};
use crate::images::{ImageInspector, ImageMetadata};
use crate::provisioner::{PluginProvisioner, ProvisionedWorkload};
use crate::readiness::ReadinessGate;

/// Result of one pass: what was handed to the execution layer, how each
/// requested image fared and whether the execution layer converged.
#[derive(Debug)]
pub struct ReconcileReport {
    pub desired: DesiredState,
    pub images: BatchReport,
    pub converge: Result<()>,
}

impl ReconcileReport {
    pub fn is_success(&self) -> bool {
        self.images.is_success() && self.converge.is_ok()
    }
}

pub struct TopologyReconciler {
    gate: ReadinessGate,
    inspector: Arc<dyn ImageInspector>,
    provisioner: PluginProvisioner,
    execution: Arc<dyn ExecutionLayer>,
}

impl TopologyReconciler {
    pub fn new(
        gate: ReadinessGate,
        inspector: Arc<dyn ImageInspector>,
        provisioner: PluginProvisioner,
        execution: Arc<dyn ExecutionLayer>,
    ) -> Self {
        Self {
            gate,
            inspector,
            provisioner,
            execution,
        }
    }

    /// Provision every image and converge the execution layer to exactly
    /// the ones that succeeded. Images that fail are left out and reported;
    /// they do not stop the rest of the pass. A convergence failure is
    /// returned alongside the per-image results.
    pub async fn reconcile(&self, images: &[String]) -> ReconcileReport {
        self.gate.wait_until_ready().await;

        let mut report = BatchReport::default();
        let mut desired = DesiredState::default();
        let mut scheduled: HashMap<String, &str> = HashMap::new();

        for image in images {
            let result = self.prepare(image, &scheduled).await;
            match result {
                Ok(service) => {
                    scheduled.insert(service.name.clone(), image.as_str());
                    desired.services.push(service);
                    report.record(image, Ok(()));
                }
                Err(e) => {
                    warn!("Skipping {}: {}", image, e);
                    report.record(image, Err(e));
                }
            }
        }

        let converge = self.execution.converge(&desired).await;
        match &converge {
            Ok(()) => info!(
                "Converged {} plugin(s), {} failed",
                desired.services.len(),
                report.failure_count()
            ),
            Err(e) => error!(
                "Failed to converge {} plugin(s): {}",
                desired.services.len(),
                e
            ),
        }

        ReconcileReport {
            desired,
            images: report,
            converge,
        }
    }

    async fn prepare(&self, image: &str, scheduled: &HashMap<String, &str>) -> Result<ServiceSpec> {
        let labels = self.inspector.labels(image).await?;
        let metadata = ImageMetadata::from_labels(&labels)?;

        let username = metadata.identity.username();
        if let Some(other) = scheduled.get(&username) {
            return Err(Error::Execution(format!(
                "{username} is already scheduled for image {other}"
            )));
        }

        let workload = self.provisioner.provision(&metadata.identity).await?;
        Ok(self.service_for(image, &metadata, &workload))
    }

    fn service_for(
        &self,
        image: &str,
        metadata: &ImageMetadata,
        workload: &ProvisionedWorkload,
    ) -> ServiceSpec {
        let identity = &workload.identity;
        let environment = BTreeMap::from([
            (
                "WAGGLE_PLUGIN_HOST".to_string(),
                self.provisioner.settings().plugin_host.clone(),
            ),
            ("WAGGLE_PLUGIN_ID".to_string(), identity.plugin_id.to_string()),
            (
                "WAGGLE_PLUGIN_VERSION".to_string(),
                identity.plugin_version.clone(),
            ),
            (
                "WAGGLE_PLUGIN_INSTANCE".to_string(),
                identity.instance.to_string(),
            ),
            ("WAGGLE_PLUGIN_USERNAME".to_string(), workload.username.clone()),
            ("WAGGLE_PLUGIN_PASSWORD".to_string(), workload.password.clone()),
        ]);

        ServiceSpec {
            name: workload.username.clone(),
            image: image.to_string(),
            environment,
            devices: metadata.device_mappings(),
            volumes: metadata.volume_mounts(),
        }
    }

    /// Remove every plugin and base service.
    pub async fn teardown(&self) -> Result<()> {
        self.execution.teardown().await
    }
}
