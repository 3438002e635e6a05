//! Keyless public endpoints: the Solana Foundation clusters, dRPC and Ankr.

use chainrelay_core::endpoint::EndpointConfig;

use crate::Cluster;

pub const SOLANA_FOUNDATION: &str = "Solana Foundation";
pub const DRPC: &str = "dRPC";
pub const ANKR: &str = "Ankr";

/// Endpoint used when no endpoints are configured.
pub const FALLBACK_URL: &str = "https://api.devnet.solana.com";

pub fn solana_foundation_url(cluster: Cluster) -> &'static str {
    match cluster {
        Cluster::MainnetBeta => "https://api.mainnet-beta.solana.com",
        Cluster::Devnet => "https://api.devnet.solana.com",
        Cluster::Testnet => "https://api.testnet.solana.com",
    }
}

pub fn ankr_url(cluster: Cluster) -> Option<&'static str> {
    match cluster {
        Cluster::MainnetBeta => Some("https://rpc.ankr.com/solana"),
        Cluster::Devnet => Some("https://rpc.ankr.com/solana_devnet"),
        Cluster::Testnet => None,
    }
}

pub fn drpc_url(cluster: Cluster) -> Option<&'static str> {
    match cluster {
        Cluster::MainnetBeta => Some("https://solana.drpc.org"),
        _ => None,
    }
}

/// The single devnet endpoint used when configuration names none.
pub fn fallback_endpoint() -> EndpointConfig {
    EndpointConfig::new(FALLBACK_URL, 1)
        .with_max_concurrency(5)
        .with_provider(SOLANA_FOUNDATION)
}

/// Every public endpoint for `cluster`, Solana Foundation first.
pub fn endpoints(cluster: Cluster) -> Vec<EndpointConfig> {
    let mut out = vec![EndpointConfig::new(solana_foundation_url(cluster), 1).with_provider(SOLANA_FOUNDATION)];
    if let Some(url) = drpc_url(cluster) {
        out.push(EndpointConfig::new(url, 2).with_provider(DRPC));
    }
    if let Some(url) = ankr_url(cluster) {
        out.push(EndpointConfig::new(url, 3).with_provider(ANKR));
    }
    out
}
