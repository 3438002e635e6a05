//! Alchemy Solana endpoints.
//!
//! Alchemy meters by compute units rather than request counts, so no default
//! request table is shipped; configure one per plan if needed.

use chainrelay_core::endpoint::EndpointConfig;

use crate::Cluster;

pub const KEY: &str = "Alchemy";

fn network(cluster: Cluster) -> &'static str {
    match cluster {
        Cluster::MainnetBeta => "solana-mainnet",
        Cluster::Devnet => "solana-devnet",
        // Alchemy has no Solana testnet; devnet is the closest network.
        Cluster::Testnet => "solana-devnet",
    }
}

pub fn http_url(api_key: &str, cluster: Cluster) -> String {
    format!("https://{}.g.alchemy.com/v2/{api_key}", network(cluster))
}

pub fn ws_url(api_key: &str, cluster: Cluster) -> String {
    format!("wss://{}.g.alchemy.com/v2/{api_key}", network(cluster))
}

pub fn endpoint(api_key: &str, cluster: Cluster, priority: u32) -> EndpointConfig {
    let mut config = EndpointConfig::new(http_url(api_key, cluster), priority).with_provider(KEY);
    config.websocket_url = Some(ws_url(api_key, cluster));
    config
}
