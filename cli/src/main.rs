//! chainrelay CLI — probe and query Solana RPC endpoints through the relay.
//!
//! Usage:
//! ```bash
//! # Health-check every configured endpoint
//! chainrelay probe --config relay.toml
//!
//! # Probe the public endpoints of a cluster
//! chainrelay probe --cluster mainnet-beta
//!
//! # One JSON-RPC call through retry, rate limiting and failover
//! chainrelay call --url https://api.devnet.solana.com --method getSlot
//! chainrelay call --method getBalance --params '["Vote111111111111111111111111111111111111111"]'
//!
//! # List built-in provider profiles
//! chainrelay providers
//! ```

use std::env;
use std::path::Path;
use std::process;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;

use chainrelay_client::{init_tracing, CallOptions, RelayClient, RelayConfig};
use chainrelay_core::endpoint::EndpointConfig;
use chainrelay_core::request::Commitment;
use chainrelay_providers::{public, Cluster};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "probe" => cmd_probe(&args[2..]).await,
        "call" => cmd_call(&args[2..]).await,
        "providers" => {
            cmd_providers();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("chainrelay {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("chainrelay {}", env!("CARGO_PKG_VERSION"));
    println!("Resilient Solana RPC access from the terminal\n");
    println!("USAGE:");
    println!("    chainrelay <COMMAND> [FLAGS]\n");
    println!("COMMANDS:");
    println!("    probe      Health-check every endpoint (latency, status)");
    println!("    call       Send one JSON-RPC call through the full pipeline");
    println!("    providers  List built-in provider profiles");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("ENDPOINT FLAGS (probe, call):");
    println!("    --config <PATH>      TOML config file (CHAINRELAY__* env overrides apply)");
    println!("    --url <URL>          Use this single endpoint instead");
    println!("    --cluster <NAME>     Use the public endpoints of mainnet-beta | devnet | testnet\n");
    println!("CALL FLAGS:");
    println!("    --method <NAME>      JSON-RPC method  [required]");
    println!("    --params <JSON>      Positional params as a JSON array  [default: []]");
    println!("    --commitment <LEVEL> processed | confirmed | finalized");
}

/// Config file plus the endpoint overrides given on the command line.
fn load_config(args: &[String]) -> Result<RelayConfig> {
    let path = parse_flag(args, "--config");
    let mut config = RelayConfig::load(path.as_deref().map(Path::new))
        .with_context(|| format!("loading config {}", path.as_deref().unwrap_or("(env only)")))?;

    if let Some(url) = parse_flag(args, "--url") {
        config.endpoints = vec![EndpointConfig::new(url, 1)];
    } else if let Some(name) = parse_flag(args, "--cluster") {
        let cluster = Cluster::parse(&name).ok_or_else(|| anyhow!("unknown cluster {name:?}"))?;
        config.endpoints = public::endpoints(cluster);
    }
    config.background_health_checks = false;
    config.validate()?;
    Ok(config)
}

async fn cmd_probe(args: &[String]) -> Result<()> {
    let config = load_config(args)?;
    init_tracing(&config.log);
    let client = RelayClient::new(config)?;

    println!("Probing {} endpoint(s)...\n", client.registry().len());
    let health = client.force_health_check().await;

    for endpoint in client.registry().endpoints() {
        let provider = chainrelay_providers::provider_key(&endpoint.config);
        let status = if endpoint.is_healthy { "OK" } else { "UNHEALTHY" };
        println!("  {}", endpoint.config.url);
        println!("    Provider: {provider}");
        println!("    Priority: {}", endpoint.config.priority);
        println!("    Status:   {status}");
        if endpoint.is_healthy {
            println!("    Latency:  {}ms", endpoint.latency.as_millis());
        }
        println!();
    }

    let stats = client.stats().endpoints;
    println!("Overall:  {health}");
    println!("Healthy:  {}/{}", stats.healthy_endpoints, stats.total_endpoints);
    if let Some(primary) = stats.primary_endpoint {
        println!("Primary:  {primary}");
    }
    Ok(())
}

async fn cmd_call(args: &[String]) -> Result<()> {
    let method = parse_flag(args, "--method").ok_or_else(|| anyhow!("--method is required"))?;
    let params = match parse_flag(args, "--params") {
        Some(raw) => match serde_json::from_str::<Value>(&raw).context("--params is not valid JSON")? {
            Value::Array(items) => items,
            _ => bail!("--params must be a JSON array"),
        },
        None => Vec::new(),
    };
    let mut options = CallOptions::default().no_cache();
    if let Some(level) = parse_flag(args, "--commitment") {
        let commitment = Commitment::parse(&level).ok_or_else(|| anyhow!("unknown commitment {level:?}"))?;
        options = options.with_commitment(commitment);
    }

    let config = load_config(args)?;
    init_tracing(&config.log);
    let client = RelayClient::new(config)?;

    let result = client.call(&method, params, &options).await.map_err(|e| {
        let user = e.to_user_facing();
        anyhow!("{user}\n  hint: {}", user.suggestion)
    })?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    client.shutdown().await;
    Ok(())
}

fn cmd_providers() {
    println!("Built-in provider profiles:\n");
    for profile in chainrelay_providers::profiles() {
        println!("  {}", profile.key);
        println!("            Hosts: {}", profile.host_markers.join(", "));
        match &profile.rate_limit {
            Some(limit) => println!(
                "            Limit: {} req / {}s, burst {}, backoff {}-{}ms",
                limit.requests,
                limit.window.as_secs(),
                limit.burst_limit,
                limit.base_backoff.as_millis(),
                limit.max_backoff.as_millis(),
            ),
            None => println!("            Limit: none (plan dependent)"),
        }
        println!();
    }
    println!("  fallback  {}", public::FALLBACK_URL);
    println!("            Used when no endpoints are configured");
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}
