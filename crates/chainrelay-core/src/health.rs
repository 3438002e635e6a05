//! Periodic liveness probing of every registered endpoint.

use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::endpoint::{EndpointConfig, EndpointRegistry, HealthCheckConfig};
use crate::error::RelayError;
use crate::transport::{ClientFactory, HealthStatus};

/// Probes endpoints through fresh client handles and feeds the results into
/// the registry.
pub struct HealthMonitor {
    registry: Arc<EndpointRegistry>,
    factory: Arc<dyn ClientFactory>,
    config: HealthCheckConfig,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        factory: Arc<dyn ClientFactory>,
        config: HealthCheckConfig,
    ) -> Self {
        Self {
            registry,
            factory,
            config,
        }
    }

    /// Probe one endpoint and record the outcome.
    pub async fn check_endpoint(&self, endpoint: &EndpointConfig) -> Result<(), RelayError> {
        let outcome = async {
            let client = self.factory.create(endpoint)?;
            tokio::time::timeout(self.config.probe_timeout, client.probe())
                .await
                .map_err(|_| RelayError::timeout(self.config.probe_timeout))?
        }
        .await;

        match outcome {
            Ok(latency) => {
                tracing::trace!(url = %endpoint.url, latency_ms = latency.as_millis() as u64, "probe ok");
                self.registry.record_probe_success(&endpoint.url, latency);
                Ok(())
            }
            Err(e) => {
                tracing::debug!(url = %endpoint.url, error = %e, "probe failed");
                self.registry.record_probe_failure(&endpoint.url);
                Err(e)
            }
        }
    }

    /// Probe every endpoint concurrently. Returns the aggregate health afterwards.
    pub async fn check_all(&self) -> HealthStatus {
        let configs: Vec<EndpointConfig> =
            self.registry.endpoints().into_iter().map(|e| e.config).collect();
        join_all(configs.iter().map(|c| self.check_endpoint(c))).await;
        let health = self.registry.health();
        tracing::debug!(health = %health, endpoints = configs.len(), "health check complete");
        health
    }

    /// Run a check now, outside the regular cadence.
    pub async fn force_health_check(&self) -> HealthStatus {
        self.check_all().await
    }

    /// Start the periodic loop. The first check runs one interval from now.
    pub fn spawn(self: Arc<Self>) -> HealthMonitorHandle {
        let period = self.config.interval;
        let monitor = self;
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.check_all().await;
            }
        });
        HealthMonitorHandle { task }
    }
}

/// Owns the background probe loop; dropping it stops probing.
pub struct HealthMonitorHandle {
    task: JoinHandle<()>,
}

impl HealthMonitorHandle {
    pub fn stop(self) {}
}

impl Drop for HealthMonitorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::Value;

    use crate::transport::RpcClient;

    struct Probe {
        url: String,
        down: Arc<Mutex<HashSet<String>>>,
    }

    #[async_trait]
    impl RpcClient for Probe {
        async fn call(&self, _method: &str, _params: Vec<Value>) -> Result<Value, RelayError> {
            if self.down.lock().unwrap().contains(&self.url) {
                Err(RelayError::Network("connection refused".into()))
            } else {
                Ok(Value::from(1u64))
            }
        }
        fn url(&self) -> &str {
            &self.url
        }
    }

    struct Factory {
        down: Arc<Mutex<HashSet<String>>>,
    }

    impl ClientFactory for Factory {
        fn create(&self, endpoint: &EndpointConfig) -> Result<Arc<dyn RpcClient>, RelayError> {
            Ok(Arc::new(Probe {
                url: endpoint.url.clone(),
                down: self.down.clone(),
            }))
        }
    }

    fn setup() -> (Arc<EndpointRegistry>, Arc<HealthMonitor>, Arc<Mutex<HashSet<String>>>) {
        let registry = Arc::new(
            EndpointRegistry::new(
                vec![
                    EndpointConfig::new("https://one.example.com", 1),
                    EndpointConfig::new("https://two.example.com", 2),
                    EndpointConfig::new("https://three.example.com", 3),
                ],
                3,
            )
            .unwrap(),
        );
        let down = Arc::new(Mutex::new(HashSet::new()));
        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            Arc::new(Factory { down: down.clone() }),
            HealthCheckConfig::default(),
        ));
        (registry, monitor, down)
    }

    #[tokio::test]
    async fn failing_primary_fails_over_then_recovers() {
        let (registry, monitor, down) = setup();
        down.lock().unwrap().insert("https://one.example.com".into());

        for _ in 0..3 {
            monitor.check_all().await;
        }
        assert_eq!(registry.select(None).unwrap().priority(), 2);
        assert_eq!(monitor.force_health_check().await, HealthStatus::Degraded);

        down.lock().unwrap().clear();
        assert_eq!(monitor.check_all().await, HealthStatus::Healthy);
        assert_eq!(registry.select(None).unwrap().priority(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn background_loop_probes_on_interval() {
        let (registry, monitor, down) = setup();
        down.lock().unwrap().insert("https://two.example.com".into());
        let handle = monitor.spawn();

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert!(!registry.get("https://two.example.com").unwrap().is_healthy);
        assert!(registry.get("https://one.example.com").unwrap().last_health_check_at.is_some());
        drop(handle);
    }
}
