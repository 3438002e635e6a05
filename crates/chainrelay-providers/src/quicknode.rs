//! QuickNode endpoints.
//!
//! QuickNode issues a per-customer subdomain and token, so URLs are built
//! from both. Limits depend on the plan; none are shipped by default.

use chainrelay_core::endpoint::EndpointConfig;

use crate::Cluster;

pub const KEY: &str = "QuickNode";

fn network(cluster: Cluster) -> &'static str {
    match cluster {
        Cluster::MainnetBeta => "solana-mainnet",
        Cluster::Devnet => "solana-devnet",
        Cluster::Testnet => "solana-testnet",
    }
}

/// `https://{endpoint_name}.{network}.quiknode.pro/{token}/`
pub fn http_url(endpoint_name: &str, token: &str, cluster: Cluster) -> String {
    format!("https://{endpoint_name}.{}.quiknode.pro/{token}/", network(cluster))
}

pub fn ws_url(endpoint_name: &str, token: &str, cluster: Cluster) -> String {
    format!("wss://{endpoint_name}.{}.quiknode.pro/{token}/", network(cluster))
}

pub fn endpoint(endpoint_name: &str, token: &str, cluster: Cluster, priority: u32) -> EndpointConfig {
    let mut config =
        EndpointConfig::new(http_url(endpoint_name, token, cluster), priority).with_provider(KEY);
    config.websocket_url = Some(ws_url(endpoint_name, token, cluster));
    config
}
