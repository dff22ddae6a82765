//! Blocks until the local broker management API answers.

use std::sync::Arc;
use std::time::Duration;

use rabbitmq_api::RabbitMqApi;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct ReadinessGate {
    api: Arc<RabbitMqApi>,
    interval: Duration,
}

impl ReadinessGate {
    pub fn new(api: Arc<RabbitMqApi>, interval: Duration) -> Self {
        Self { api, interval }
    }

    /// Poll the API root until any HTTP response arrives.
    ///
    /// Error statuses count as ready. There is no deadline; wrap in
    /// `tokio::time::timeout` when one is needed.
    pub async fn wait_until_ready(&self) {
        loop {
            match self.api.probe().await {
                Ok(status) => {
                    debug!("Broker management API answered with {}", status);
                    return;
                }
                Err(e) => {
                    info!("Waiting for rabbitmq at {}...", self.api.base_url());
                    debug!("Readiness probe failed: {}", e);
                    tokio::time::sleep(self.interval).await;
                }
            }
        }
    }
}
