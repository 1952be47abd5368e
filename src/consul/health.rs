//! Health gate: waits for a newly registered instance to report healthy

use crate::config::HealthGateConfig;
use crate::consul::client::ConsulClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Polls Consul until a registered instance passes its checks or a deadline
/// fires.
pub struct ConsulHealthChecker {
    client: Arc<ConsulClient>,
    deadline: Duration,
    poll_interval: Duration,
}

impl ConsulHealthChecker {
    pub fn new(client: Arc<ConsulClient>, config: &HealthGateConfig) -> Self {
        Self {
            client,
            deadline: Duration::from_secs(config.deadline_secs),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
        }
    }

    /// Wait until the instance with `service_id` shows up healthy under
    /// `service_name`, or the deadline elapses.
    ///
    /// Transient Consul errors are indistinguishable from "not yet healthy";
    /// they are absorbed until the next tick. Dropping the returned future
    /// aborts the wait.
    pub async fn wait_for_healthy(&self, service_name: &str, service_id: &str) -> bool {
        let deadline = Instant::now() + self.deadline;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            "Waiting up to {:?} for {} to report healthy",
            self.deadline, service_id
        );

        loop {
            ticker.tick().await;

            if Instant::now() >= deadline {
                warn!(
                    "Service {} did not become healthy within {:?}",
                    service_id, self.deadline
                );
                return false;
            }

            match self.client.health_service_nodes(service_name, true).await {
                Ok(entries) => {
                    let healthy = entries
                        .iter()
                        .any(|entry| entry.service.id == service_id && entry.is_passing());
                    if healthy {
                        info!("Service {} reported healthy by Consul", service_id);
                        return true;
                    }
                    debug!("Service {} not yet healthy", service_id);
                }
                Err(e) => {
                    debug!("Health poll for {} failed: {}", service_id, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsulConfig;

    // No Consul listens on this port; every poll errors out and the gate
    // must expire at the deadline rather than propagate.
    fn unreachable_checker(deadline_secs: u64) -> ConsulHealthChecker {
        let consul = ConsulConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            connect_timeout_ms: 50,
            request_timeout_ms: 50,
            ..ConsulConfig::default()
        };
        let client = Arc::new(ConsulClient::new(&consul).unwrap());
        ConsulHealthChecker::new(
            client,
            &HealthGateConfig {
                deadline_secs,
                poll_interval_secs: 1,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_when_store_unreachable() {
        let checker = unreachable_checker(3);
        let healthy = checker.wait_for_healthy("ghost", "ghost-10.0.0.1-1").await;
        assert!(!healthy);
    }
}
