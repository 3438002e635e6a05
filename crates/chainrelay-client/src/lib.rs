//! chainrelay-client — the ChainRelay facade.
//!
//! [`RelayClient`] wires the core primitives into one access point:
//!
//! ```text
//! RelayClient ─┬─ ResponseCache (fresh → network → stale)
//!              ├─ RpcPipeline: retry → rate limiter → dedup → connection pool
//!              ├─ HealthMonitor (background probes)
//!              ├─ SubscriptionManager (optional, needs a pubsub connector)
//!              └─ TransactionManager over RpcTransactionBackend
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use chainrelay_client::{CallOptions, RelayClient, RelayConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RelayConfig::load(None)?;
//! chainrelay_client::init_tracing(&config.log);
//! let client = RelayClient::new(config)?;
//! let slot = client.call("getSlot", vec![], &CallOptions::default()).await?;
//! println!("slot {slot}");
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod client;
pub mod config;
pub mod fetch;
pub mod logging;
pub mod pipeline;

pub use backend::RpcTransactionBackend;
pub use cache::{CacheConfig, CacheStats, FetchSource, ResponseCache};
pub use client::{RelayClient, RelayClientBuilder, RelayStats};
pub use config::{ConfigError, RelayConfig, ENV_PREFIX};
pub use fetch::{CallOptions, FetchResult, Keyed, Page, Pagination, ProgramQuery, RecordDecoder};
pub use logging::{init_tracing, LogConfig};
pub use pipeline::RpcPipeline;
