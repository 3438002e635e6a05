//! chainrelay-providers — Pre-configured profiles for Solana RPC providers.
//!
//! Each provider module knows its URL templates per [`Cluster`] and, where the
//! provider publishes one, a default rate-limit profile. [`provider_for_url`]
//! maps an endpoint URL to the provider key the rate limiter buckets under.
//!
//! # Quick start
//! ```rust,no_run
//! use chainrelay_providers::{helius, Cluster};
//!
//! let endpoint = helius::endpoint("YOUR_API_KEY", Cluster::Devnet, 1);
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use chainrelay_core::endpoint::EndpointConfig;
use chainrelay_core::policy::{RateLimitConfig, RateLimiterConfig};

pub mod alchemy;
pub mod helius;
pub mod public;
pub mod quicknode;

/// Solana network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Cluster {
    #[serde(alias = "mainnet")]
    MainnetBeta,
    #[default]
    Devnet,
    Testnet,
}

impl Cluster {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MainnetBeta => "mainnet-beta",
            Self::Devnet => "devnet",
            Self::Testnet => "testnet",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "mainnet-beta" => Some(Self::MainnetBeta),
            "devnet" => Some(Self::Devnet),
            "testnet" => Some(Self::Testnet),
            _ => None,
        }
    }
}

impl std::fmt::Display for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A known provider: display key, hostname markers, optional default limits.
#[derive(Debug, Clone)]
pub struct ProviderProfile {
    pub key: &'static str,
    /// Substrings of the lowercase hostname that identify the provider.
    pub host_markers: &'static [&'static str],
    pub rate_limit: Option<RateLimitConfig>,
}

fn limit(requests: u32, burst_limit: u32, base_backoff_ms: u64, max_backoff_ms: u64) -> RateLimitConfig {
    RateLimitConfig {
        requests,
        window: Duration::from_secs(60),
        burst_limit,
        base_backoff: Duration::from_millis(base_backoff_ms),
        max_backoff: Duration::from_millis(max_backoff_ms),
    }
}

/// Every built-in profile, in match order.
pub fn profiles() -> Vec<ProviderProfile> {
    vec![
        ProviderProfile {
            key: public::SOLANA_FOUNDATION,
            host_markers: &["solana.com"],
            rate_limit: Some(limit(100, 10, 1_000, 30_000)),
        },
        ProviderProfile {
            key: public::DRPC,
            host_markers: &["drpc."],
            rate_limit: Some(limit(300, 20, 500, 15_000)),
        },
        ProviderProfile {
            key: public::ANKR,
            host_markers: &["ankr."],
            rate_limit: Some(limit(200, 15, 750, 20_000)),
        },
        ProviderProfile {
            key: helius::KEY,
            host_markers: &["helius.", "helius-rpc."],
            rate_limit: Some(limit(500, 30, 300, 10_000)),
        },
        ProviderProfile {
            key: quicknode::KEY,
            host_markers: &["quicknode.", "quiknode."],
            rate_limit: None,
        },
        ProviderProfile {
            key: alchemy::KEY,
            host_markers: &["alchemy."],
            rate_limit: None,
        },
    ]
}

pub fn profile(key: &str) -> Option<ProviderProfile> {
    profiles().into_iter().find(|p| p.key == key)
}

/// Provider key for an endpoint URL: a known profile's key, otherwise the
/// lowercase hostname, or `"unknown"` if the URL does not parse.
pub fn provider_for_url(url: &str) -> String {
    let Some(host) = url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
    else {
        return "unknown".to_string();
    };
    profiles()
        .into_iter()
        .find(|p| p.host_markers.iter().any(|m| host.contains(m)))
        .map(|p| p.key.to_string())
        .unwrap_or(host)
}

/// The key an endpoint is rate limited under: its explicit provider if set,
/// otherwise [`provider_for_url`].
pub fn provider_key(endpoint: &EndpointConfig) -> String {
    endpoint
        .provider
        .clone()
        .unwrap_or_else(|| provider_for_url(&endpoint.url))
}

/// Set `provider` on every endpoint that lacks one.
pub fn tag_endpoints(endpoints: &mut [EndpointConfig]) {
    for endpoint in endpoints {
        if endpoint.provider.is_none() {
            endpoint.provider = Some(provider_for_url(&endpoint.url));
        }
    }
}

/// Default per-provider limits for every profile that publishes one.
pub fn default_rate_limits() -> HashMap<String, RateLimitConfig> {
    profiles()
        .into_iter()
        .filter_map(|p| p.rate_limit.map(|l| (p.key.to_string(), l)))
        .collect()
}

/// Limiter config with the built-in table; explicit `overrides` win.
pub fn limiter_config(overrides: &HashMap<String, RateLimitConfig>) -> RateLimiterConfig {
    let mut providers = default_rate_limits();
    providers.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    RateLimiterConfig {
        providers,
        ..Default::default()
    }
}
