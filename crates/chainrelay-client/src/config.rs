//! [`RelayConfig`] — everything a [`RelayClient`](crate::RelayClient) needs,
//! loaded from a TOML file plus `CHAINRELAY__*` environment overrides.
//!
//! ```toml
//! request-timeout-ms = 15000
//!
//! [[endpoints]]
//! url = "https://api.devnet.solana.com"
//! priority = 1
//!
//! [rate-limiter.providers.Helius]
//! requests = 100
//! window-ms = 60000
//! burst-limit = 10
//! base-backoff-ms = 500
//! max-backoff-ms = 5000
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use chainrelay_core::endpoint::{EndpointConfig, HealthCheckConfig};
use chainrelay_core::error::RelayError;
use chainrelay_core::policy::{DedupConfig, RateLimitConfig, RateLimiterConfig, RetryConfig};
use chainrelay_core::request::Commitment;
use chainrelay_http::HttpClientConfig;
use chainrelay_tx::TransactionConfig;
use chainrelay_ws::WsConfig;

use crate::cache::CacheConfig;
use crate::logging::LogConfig;

/// Environment variable prefix; nested keys are separated by `__`,
/// e.g. `CHAINRELAY__RETRY__MAX_RETRIES=5`.
pub const ENV_PREFIX: &str = "CHAINRELAY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<RelayError> for ConfigError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Config(msg) => Self::Invalid(msg),
            other => Self::Invalid(other.to_string()),
        }
    }
}

impl From<ConfigError> for RelayError {
    fn from(err: ConfigError) -> Self {
        RelayError::Config(err.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RelayConfig {
    /// Empty means the public devnet fallback endpoint.
    pub endpoints: Vec<EndpointConfig>,
    pub health: HealthCheckConfig,
    /// Run the periodic health monitor in the background.
    pub background_health_checks: bool,
    pub http: HttpClientConfig,
    /// Per-provider limits. Layered over the built-in provider table when
    /// `provider-defaults` is set.
    pub rate_limiter: RateLimiterConfig,
    pub provider_defaults: bool,
    pub retry: RetryConfig,
    pub dedup: DedupConfig,
    pub cache: CacheConfig,
    pub websocket: WsConfig,
    pub transactions: TransactionConfig,
    /// Bounds one pooled call.
    #[serde(with = "chainrelay_core::serde_ms", rename = "request-timeout-ms")]
    pub request_timeout: Duration,
    /// Bounds the wait for rate-limiter admission.
    #[serde(with = "chainrelay_core::serde_ms", rename = "queue-timeout-ms")]
    pub queue_timeout: Duration,
    /// Default consistency level for reads.
    pub commitment: Commitment,
    pub log: LogConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            health: HealthCheckConfig::default(),
            background_health_checks: true,
            http: HttpClientConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            provider_defaults: true,
            retry: RetryConfig::default(),
            dedup: DedupConfig::default(),
            cache: CacheConfig::default(),
            websocket: WsConfig::default(),
            transactions: TransactionConfig::default(),
            request_timeout: Duration::from_secs(30),
            queue_timeout: Duration::from_secs(30),
            commitment: Commitment::Confirmed,
            log: LogConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        Self::finish(builder)
    }

    /// Parse TOML text, then apply environment overrides.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::finish(
            config::Config::builder().add_source(config::File::from_str(toml, config::FileFormat::Toml)),
        )
    }

    fn finish(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        let loaded: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .convert_case(config::Case::Kebab),
            )
            .build()?
            .try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            endpoint.validate()?;
            if !seen.insert(endpoint.url.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate endpoint {}", endpoint.url)));
            }
        }
        self.rate_limiter.validate()?;
        self.transactions.validate()?;

        let positive = [
            ("request-timeout-ms", self.request_timeout),
            ("queue-timeout-ms", self.queue_timeout),
            ("health.interval-ms", self.health.interval),
            ("health.probe-timeout-ms", self.health.probe_timeout),
            ("retry.attempt-timeout-ms", self.retry.attempt_timeout),
            ("dedup.window-ms", self.dedup.window),
            ("dedup.sweep-interval-ms", self.dedup.sweep_interval),
            ("cache.ttl-ms", self.cache.ttl),
            ("websocket.ping-interval-ms", self.websocket.ping_interval),
            ("websocket.reconnect-base-ms", self.websocket.reconnect_base),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::Invalid(format!("{key} must be > 0")));
        }
        if self.health.unhealthy_threshold == 0 {
            return Err(ConfigError::Invalid("health.unhealthy-threshold must be >= 1".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid("retry.multiplier must be >= 1.0".into()));
        }
        if self.dedup.max_in_flight == 0 || self.cache.max_entries == 0 {
            return Err(ConfigError::Invalid(
                "dedup.max-in-flight and cache.max-entries must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Configured endpoints, or the public devnet fallback. Every endpoint
    /// comes back with its provider key filled in.
    pub fn resolved_endpoints(&self) -> Vec<EndpointConfig> {
        let mut endpoints = if self.endpoints.is_empty() {
            vec![chainrelay_providers::public::fallback_endpoint()]
        } else {
            self.endpoints.clone()
        };
        chainrelay_providers::tag_endpoints(&mut endpoints);
        endpoints
    }

    /// Limiter config with provider defaults folded in.
    pub fn resolved_rate_limiter(&self) -> RateLimiterConfig {
        let overrides: HashMap<String, RateLimitConfig> = self
            .rate_limiter
            .providers
            .iter()
            .map(|(key, limit)| (canonical_provider_key(key), limit.clone()))
            .collect();
        let providers = if self.provider_defaults {
            chainrelay_providers::limiter_config(&overrides).providers
        } else {
            overrides
        };
        RateLimiterConfig {
            providers,
            ..self.rate_limiter.clone()
        }
    }
}

/// Configuration keys may come back lowercased; map them onto the built-in
/// profile spelling so they line up with endpoint provider keys.
fn canonical_provider_key(key: &str) -> String {
    chainrelay_providers::profiles()
        .into_iter()
        .find(|p| p.key.eq_ignore_ascii_case(key))
        .map(|p| p.key.to_string())
        .unwrap_or_else(|| key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        RelayConfig::default().validate().unwrap();
    }

    #[test]
    fn parses_toml() {
        let cfg = RelayConfig::from_toml_str(
            r#"
            request-timeout-ms = 15000
            commitment = "finalized"

            [[endpoints]]
            url = "https://api.devnet.solana.com"
            priority = 1

            [[endpoints]]
            url = "https://rpc.ankr.com/solana_devnet"
            priority = 2
            max-concurrency = 8

            [retry]
            max-retries = 5

            [rate-limiter.providers.Helius]
            requests = 100
            window-ms = 60000
            burst-limit = 10
            base-backoff-ms = 500
            max-backoff-ms = 5000
            "#,
        )
        .unwrap();

        assert_eq!(cfg.request_timeout, Duration::from_secs(15));
        assert_eq!(cfg.commitment, Commitment::Finalized);
        assert_eq!(cfg.endpoints.len(), 2);
        assert_eq!(cfg.endpoints[1].max_concurrency, 8);
        assert_eq!(cfg.retry.max_retries, 5);
        assert_eq!(cfg.retry.initial_backoff, Duration::from_secs(1));

        let limiter = cfg.resolved_rate_limiter();
        assert_eq!(limiter.providers["Helius"].requests, 100);
        assert_eq!(limiter.providers["Ankr"].requests, 200);
    }

    #[test]
    fn duplicate_endpoints_rejected() {
        let mut cfg = RelayConfig::default();
        cfg.endpoints = vec![
            EndpointConfig::new("https://a.example", 1),
            EndpointConfig::new("https://a.example", 2),
        ];
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut cfg = RelayConfig::default();
        cfg.request_timeout = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_endpoint_list_falls_back_to_devnet() {
        let endpoints = RelayConfig::default().resolved_endpoints();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].url, "https://api.devnet.solana.com");
        assert_eq!(endpoints[0].provider.as_deref(), Some("Solana Foundation"));
    }

    #[test]
    fn provider_defaults_can_be_disabled() {
        let mut cfg = RelayConfig::default();
        cfg.provider_defaults = false;
        assert!(cfg.resolved_rate_limiter().providers.is_empty());
    }

    #[test]
    fn lowercased_keys_map_to_profiles() {
        assert_eq!(canonical_provider_key("helius"), "Helius");
        assert_eq!(canonical_provider_key("solana foundation"), "Solana Foundation");
        assert_eq!(canonical_provider_key("my-node"), "my-node");
    }
}
