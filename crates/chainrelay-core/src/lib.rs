//! chainrelay-core — resilience primitives for ChainRelay.
//!
//! # Overview
//!
//! ChainRelay turns a set of unreliable, rate-limited RPC endpoints into one
//! dependable access point. The core crate defines:
//!
//! - [`RpcClient`] / [`ClientFactory`] — the injected network client seam
//! - [`EndpointRegistry`] and [`HealthMonitor`] — endpoint health and failover
//! - [`ConnectionPool`] — per-endpoint client handles
//! - [`policy`] module — retry, rate limiter, request deduplication
//! - [`RelayError`] / [`UserFacingError`] — the error taxonomy

pub mod endpoint;
pub mod error;
pub mod health;
pub mod policy;
pub mod pool;
pub mod request;
pub mod serde_ms;
pub mod transport;

pub use endpoint::{Endpoint, EndpointConfig, EndpointRegistry, HealthCheckConfig, RegistryStats};
pub use error::{ErrorKind, RelayError, UserFacingError};
pub use health::{HealthMonitor, HealthMonitorHandle};
pub use pool::{ConnectionPool, PoolStats};
pub use request::{Commitment, JsonRpcError, RpcCall, RpcReply};
pub use transport::{ClientFactory, HealthStatus, RpcClient, RpcClientExt};
