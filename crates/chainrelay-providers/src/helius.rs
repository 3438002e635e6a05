//! Helius endpoints.
//!
//! Default limits: 500 requests per minute, burst 30, backoff 300ms up to 10s.

use chainrelay_core::endpoint::EndpointConfig;

use crate::Cluster;

pub const KEY: &str = "Helius";

fn host(cluster: Cluster) -> &'static str {
    match cluster {
        Cluster::MainnetBeta => "mainnet.helius-rpc.com",
        Cluster::Devnet | Cluster::Testnet => "devnet.helius-rpc.com",
    }
}

/// HTTP JSON-RPC URL. The API key travels as a query parameter.
pub fn http_url(api_key: &str, cluster: Cluster) -> String {
    format!("https://{}/?api-key={api_key}", host(cluster))
}

pub fn ws_url(api_key: &str, cluster: Cluster) -> String {
    format!("wss://{}/?api-key={api_key}", host(cluster))
}

pub fn endpoint(api_key: &str, cluster: Cluster, priority: u32) -> EndpointConfig {
    let mut config = EndpointConfig::new(http_url(api_key, cluster), priority).with_provider(KEY);
    config.websocket_url = Some(ws_url(api_key, cluster));
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_carry_key() {
        assert_eq!(
            http_url("abc", Cluster::Devnet),
            "https://devnet.helius-rpc.com/?api-key=abc"
        );
        assert_eq!(ws_url("abc", Cluster::MainnetBeta), "wss://mainnet.helius-rpc.com/?api-key=abc");
    }

    #[test]
    fn endpoint_is_tagged_and_limited() {
        let e = endpoint("abc", Cluster::MainnetBeta, 1);
        assert!(e.validate().is_ok());
        assert_eq!(crate::provider_key(&e), KEY);
        assert!(crate::default_rate_limits().contains_key(KEY));
    }
}
