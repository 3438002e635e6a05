//! Endpoint registry: configured RPC endpoints and their live health.
//!
//! Selection rule: the healthy endpoint with the lowest `(priority, latency)`.
//! Health fields are only written through [`EndpointRegistry::record_probe_success`]
//! and [`EndpointRegistry::record_probe_failure`], which the health monitor calls.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use url::Url;

use crate::error::RelayError;
use crate::transport::HealthStatus;

fn default_priority() -> u32 {
    1
}
fn default_max_concurrency() -> usize {
    5
}

/// Static configuration for one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EndpointConfig {
    pub url: String,
    /// Lower is preferred.
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Maximum client handles the pool creates for this endpoint.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Rate-limit provider key. Derived from the host when absent.
    #[serde(default)]
    pub provider: Option<String>,
    /// Explicit pubsub URL. Derived from `url` when absent.
    #[serde(default)]
    pub websocket_url: Option<String>,
}

impl EndpointConfig {
    pub fn new(url: impl Into<String>, priority: u32) -> Self {
        Self {
            url: url.into(),
            priority,
            max_concurrency: default_max_concurrency(),
            provider: None,
            websocket_url: None,
        }
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// The key the rate limiter buckets this endpoint under.
    pub fn provider_key(&self) -> String {
        if let Some(provider) = &self.provider {
            return provider.clone();
        }
        Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Pubsub URL for this endpoint.
    pub fn websocket_url(&self) -> String {
        self.websocket_url
            .clone()
            .unwrap_or_else(|| derive_websocket_url(&self.url))
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        let parsed = Url::parse(&self.url)
            .map_err(|e| RelayError::Config(format!("endpoint url {:?}: {e}", self.url)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RelayError::Config(format!(
                "endpoint url {:?} must use http or https",
                self.url
            )));
        }
        if self.max_concurrency == 0 {
            return Err(RelayError::Config(format!(
                "endpoint {:?} needs max-concurrency >= 1",
                self.url
            )));
        }
        Ok(())
    }
}

/// `https://host/path` → `wss://host/path`, `http` → `ws`.
pub fn derive_websocket_url(http_url: &str) -> String {
    match Url::parse(http_url) {
        Ok(mut url) => {
            let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
            // set_scheme only fails across special/non-special schemes
            if url.set_scheme(scheme).is_ok() {
                return url.to_string();
            }
            http_url.replacen("http", "ws", 1)
        }
        Err(_) => http_url.replacen("http", "ws", 1),
    }
}

/// Health-check cadence and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HealthCheckConfig {
    #[serde(with = "crate::serde_ms", rename = "interval-ms")]
    pub interval: Duration,
    #[serde(with = "crate::serde_ms", rename = "probe-timeout-ms")]
    pub probe_timeout: Duration,
    /// Consecutive failed probes before an endpoint is marked unhealthy.
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
        }
    }
}

/// An endpoint together with its live health.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub config: EndpointConfig,
    pub is_healthy: bool,
    pub last_health_check_at: Option<Instant>,
    pub latency: Duration,
    pub consecutive_errors: u32,
}

impl Endpoint {
    fn new(config: EndpointConfig) -> Self {
        Self {
            config,
            is_healthy: true,
            last_health_check_at: None,
            latency: Duration::ZERO,
            consecutive_errors: 0,
        }
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn priority(&self) -> u32 {
        self.config.priority
    }
}

/// Point-in-time view of the registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub total_endpoints: usize,
    pub healthy_endpoints: usize,
    /// Mean latency across healthy endpoints.
    pub average_latency: Duration,
    /// Sum of consecutive error counters.
    pub error_count: u32,
    pub primary_endpoint: Option<String>,
}

/// Thread-safe registry of endpoints.
pub struct EndpointRegistry {
    endpoints: Mutex<Vec<Endpoint>>,
    unhealthy_threshold: u32,
}

impl EndpointRegistry {
    /// Build a registry; every config is validated and URLs must be unique.
    pub fn new(configs: Vec<EndpointConfig>, unhealthy_threshold: u32) -> Result<Self, RelayError> {
        if configs.is_empty() {
            return Err(RelayError::Config("at least one endpoint is required".into()));
        }
        let registry = Self {
            endpoints: Mutex::new(Vec::with_capacity(configs.len())),
            unhealthy_threshold: unhealthy_threshold.max(1),
        };
        for config in configs {
            registry.add_endpoint(config)?;
        }
        Ok(registry)
    }

    /// Add an endpoint. It starts out healthy.
    pub fn add_endpoint(&self, config: EndpointConfig) -> Result<(), RelayError> {
        config.validate()?;
        let mut endpoints = self.endpoints.lock().unwrap();
        if endpoints.iter().any(|e| e.config.url == config.url) {
            return Err(RelayError::Config(format!("duplicate endpoint {:?}", config.url)));
        }
        tracing::debug!(url = %config.url, priority = config.priority, "endpoint added");
        endpoints.push(Endpoint::new(config));
        Ok(())
    }

    /// Remove an endpoint. Returns `false` if it was not registered.
    pub fn remove_endpoint(&self, url: &str) -> bool {
        let mut endpoints = self.endpoints.lock().unwrap();
        let before = endpoints.len();
        endpoints.retain(|e| e.config.url != url);
        before != endpoints.len()
    }

    pub fn len(&self) -> usize {
        self.endpoints.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every endpoint in registration order.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.lock().unwrap().clone()
    }

    pub fn get(&self, url: &str) -> Option<Endpoint> {
        self.endpoints
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.config.url == url)
            .cloned()
    }

    /// Healthy endpoints sorted by `(priority, latency)`.
    pub fn healthy_endpoints(&self) -> Vec<Endpoint> {
        let mut healthy: Vec<Endpoint> = self
            .endpoints
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.is_healthy)
            .cloned()
            .collect();
        healthy.sort_by(|a, b| {
            a.config
                .priority
                .cmp(&b.config.priority)
                .then(a.latency.cmp(&b.latency))
        });
        healthy
    }

    /// The preferred endpoint if healthy, otherwise the best healthy one.
    pub fn select(&self, preferred: Option<&str>) -> Option<Endpoint> {
        if let Some(url) = preferred {
            if let Some(endpoint) = self.get(url).filter(|e| e.is_healthy) {
                return Some(endpoint);
            }
        }
        self.healthy_endpoints().into_iter().next()
    }

    /// URL of the endpoint `select(None)` would currently return.
    pub fn primary_endpoint(&self) -> Option<String> {
        self.select(None).map(|e| e.config.url)
    }

    /// A probe succeeded: healthy again, one error forgiven, latency updated.
    pub fn record_probe_success(&self, url: &str, latency: Duration) {
        let mut endpoints = self.endpoints.lock().unwrap();
        if let Some(endpoint) = endpoints.iter_mut().find(|e| e.config.url == url) {
            if !endpoint.is_healthy {
                tracing::info!(url = %url, latency_ms = latency.as_millis() as u64, "endpoint recovered");
            }
            endpoint.is_healthy = true;
            endpoint.consecutive_errors = endpoint.consecutive_errors.saturating_sub(1);
            endpoint.latency = latency;
            endpoint.last_health_check_at = Some(Instant::now());
        }
    }

    /// A probe failed. Returns `true` if this failure flipped the endpoint to unhealthy.
    pub fn record_probe_failure(&self, url: &str) -> bool {
        let mut endpoints = self.endpoints.lock().unwrap();
        let Some(endpoint) = endpoints.iter_mut().find(|e| e.config.url == url) else {
            return false;
        };
        endpoint.consecutive_errors += 1;
        endpoint.last_health_check_at = Some(Instant::now());
        if endpoint.is_healthy && endpoint.consecutive_errors >= self.unhealthy_threshold {
            endpoint.is_healthy = false;
            tracing::warn!(
                url = %url,
                errors = endpoint.consecutive_errors,
                "endpoint marked unhealthy"
            );
            return true;
        }
        false
    }

    /// Aggregate health across all endpoints.
    pub fn health(&self) -> HealthStatus {
        let endpoints = self.endpoints.lock().unwrap();
        if endpoints.is_empty() {
            return HealthStatus::Unknown;
        }
        match endpoints.iter().filter(|e| e.is_healthy).count() {
            0 => HealthStatus::Unhealthy,
            n if n == endpoints.len() => HealthStatus::Healthy,
            _ => HealthStatus::Degraded,
        }
    }

    pub fn stats(&self) -> RegistryStats {
        let primary_endpoint = self.primary_endpoint();
        let endpoints = self.endpoints.lock().unwrap();
        let healthy: Vec<&Endpoint> = endpoints.iter().filter(|e| e.is_healthy).collect();
        let average_latency = if healthy.is_empty() {
            Duration::ZERO
        } else {
            healthy.iter().map(|e| e.latency).sum::<Duration>() / healthy.len() as u32
        };
        RegistryStats {
            total_endpoints: endpoints.len(),
            healthy_endpoints: healthy.len(),
            average_latency,
            error_count: endpoints.iter().map(|e| e.consecutive_errors).sum(),
            primary_endpoint,
        }
    }

    /// Zero error counters and latencies. Health flags are left alone.
    pub fn reset_stats(&self) {
        for endpoint in self.endpoints.lock().unwrap().iter_mut() {
            endpoint.consecutive_errors = 0;
            endpoint.latency = Duration::ZERO;
        }
    }
}

impl std::fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("endpoints", &self.len())
            .field("health", &self.health())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(priorities: &[u32]) -> EndpointRegistry {
        let configs = priorities
            .iter()
            .map(|p| EndpointConfig::new(format!("https://rpc{p}.example.com"), *p))
            .collect();
        EndpointRegistry::new(configs, 3).unwrap()
    }

    #[test]
    fn selects_lowest_priority() {
        let reg = registry(&[3, 1, 2]);
        assert_eq!(reg.select(None).unwrap().priority(), 1);
    }

    #[test]
    fn priority_tie_broken_by_latency() {
        let reg = EndpointRegistry::new(
            vec![
                EndpointConfig::new("https://slow.example.com", 1),
                EndpointConfig::new("https://fast.example.com", 1),
            ],
            3,
        )
        .unwrap();
        reg.record_probe_success("https://slow.example.com", Duration::from_millis(400));
        reg.record_probe_success("https://fast.example.com", Duration::from_millis(40));
        assert_eq!(reg.select(None).unwrap().url(), "https://fast.example.com");
    }

    #[test]
    fn failover_after_three_failed_probes_and_self_heal() {
        let reg = registry(&[1, 2, 3]);
        let primary = "https://rpc1.example.com";

        assert!(!reg.record_probe_failure(primary));
        assert!(!reg.record_probe_failure(primary));
        assert_eq!(reg.select(None).unwrap().priority(), 1, "still healthy after two");
        assert!(reg.record_probe_failure(primary));
        assert_eq!(reg.select(None).unwrap().priority(), 2);
        assert_eq!(reg.health(), HealthStatus::Degraded);

        reg.record_probe_success(primary, Duration::from_millis(10));
        assert_eq!(reg.select(None).unwrap().priority(), 1);
        assert_eq!(reg.get(primary).unwrap().consecutive_errors, 2);
    }

    #[test]
    fn all_unhealthy_selects_none() {
        let reg = registry(&[1, 2]);
        for url in ["https://rpc1.example.com", "https://rpc2.example.com"] {
            for _ in 0..3 {
                reg.record_probe_failure(url);
            }
        }
        assert!(reg.select(None).is_none());
        assert!(reg.select(Some("https://rpc2.example.com")).is_none());
        assert_eq!(reg.health(), HealthStatus::Unhealthy);
    }

    #[test]
    fn preferred_endpoint_used_when_healthy() {
        let reg = registry(&[1, 2]);
        let chosen = reg.select(Some("https://rpc2.example.com")).unwrap();
        assert_eq!(chosen.priority(), 2);
        let fallback = reg.select(Some("https://missing.example.com")).unwrap();
        assert_eq!(fallback.priority(), 1);
    }

    #[test]
    fn error_count_floors_at_zero() {
        let reg = registry(&[1]);
        reg.record_probe_success("https://rpc1.example.com", Duration::from_millis(5));
        assert_eq!(reg.get("https://rpc1.example.com").unwrap().consecutive_errors, 0);
    }

    #[test]
    fn rejects_duplicates_and_bad_urls() {
        let reg = registry(&[1]);
        assert!(reg.add_endpoint(EndpointConfig::new("https://rpc1.example.com", 4)).is_err());
        assert!(reg.add_endpoint(EndpointConfig::new("not a url", 4)).is_err());
        assert!(reg
            .add_endpoint(EndpointConfig::new("https://x.example.com", 4).with_max_concurrency(0))
            .is_err());
        assert!(EndpointRegistry::new(vec![], 3).is_err());
    }

    #[test]
    fn remove_endpoint_updates_primary() {
        let reg = registry(&[1, 2]);
        assert!(reg.remove_endpoint("https://rpc1.example.com"));
        assert_eq!(reg.primary_endpoint().as_deref(), Some("https://rpc2.example.com"));
        assert!(!reg.remove_endpoint("https://rpc1.example.com"));
    }

    #[test]
    fn provider_key_and_websocket_url() {
        let cfg = EndpointConfig::new("https://API.Devnet.Solana.com/rpc", 1);
        assert_eq!(cfg.provider_key(), "api.devnet.solana.com");
        assert_eq!(cfg.websocket_url(), "wss://api.devnet.solana.com/rpc");
        assert_eq!(derive_websocket_url("http://localhost:8899/"), "ws://localhost:8899/");
        assert_eq!(cfg.with_provider("helius").provider_key(), "helius");
    }
}
