//! Diagnostic summary of node state.

use std::fmt;
use std::path::Path;

use rabbitmq_api::{QueueInfo, RabbitMqApi, ShovelStatus};
use waggle_node_lib::CredentialStore;

use crate::config::NodeEnv;

#[derive(Debug)]
pub struct NodeReport {
    pub registration_key_present: bool,
    pub node_id: String,
    pub beehive_host: String,
    pub bundle_present: bool,
    pub reverse_tunnel_port: Option<u16>,
    pub queues: Result<Vec<QueueInfo>, String>,
    pub shovels: Result<Vec<ShovelStatus>, String>,
}

impl NodeReport {
    /// Collect the report. Broker failures are captured in the report
    /// rather than returned.
    pub async fn gather(
        node: &NodeEnv,
        registration_key: &Path,
        store: &CredentialStore,
        api: &RabbitMqApi,
    ) -> Self {
        let bundle_present = store.exists();
        let reverse_tunnel_port = if bundle_present {
            store.load().ok().map(|b| b.reverse_tunnel_port)
        } else {
            None
        };

        Self {
            registration_key_present: registration_key.exists(),
            node_id: node.node_id.clone(),
            beehive_host: node.beehive_host.clone(),
            bundle_present,
            reverse_tunnel_port,
            queues: api.list_queues().await.map_err(|e| e.to_string()),
            shovels: api.list_shovels().await.map_err(|e| e.to_string()),
        }
    }
}

fn yes_no(value: bool) -> &'static str {
    if value { "Yes" } else { "No" }
}

impl fmt::Display for NodeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Config Info ===")?;
        writeln!(
            f,
            "Registration Key Exists: {}",
            yes_no(self.registration_key_present)
        )?;
        writeln!(f, "Node ID: {}", self.node_id)?;
        writeln!(f, "Beehive Host: {}", self.beehive_host)?;
        writeln!(f, "Credentials Present: {}", yes_no(self.bundle_present))?;
        if let Some(port) = self.reverse_tunnel_port {
            writeln!(f, "Reverse SSH Port: {port}")?;
        }
        writeln!(f)?;

        writeln!(f, "=== RabbitMQ Queue Status ===")?;
        match &self.queues {
            Ok(queues) => {
                for queue in queues {
                    writeln!(
                        f,
                        "{}\t{}",
                        queue.name,
                        queue.messages.map_or("-".to_string(), |n| n.to_string())
                    )?;
                }
            }
            Err(e) => writeln!(f, "unavailable: {e}")?,
        }
        writeln!(f)?;

        writeln!(f, "=== RabbitMQ Shovel Status ===")?;
        match &self.shovels {
            Ok(shovels) => {
                for shovel in shovels {
                    write!(
                        f,
                        "{}\t{}",
                        shovel.name,
                        shovel.state.as_deref().unwrap_or("unknown")
                    )?;
                    if let Some(reason) = &shovel.reason {
                        write!(f, "\t{reason}")?;
                    }
                    writeln!(f)?;
                }
            }
            Err(e) => writeln!(f, "unavailable: {e}")?,
        }
        Ok(())
    }
}
