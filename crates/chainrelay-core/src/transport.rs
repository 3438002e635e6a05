//! The injected network client traits.
//!
//! ChainRelay never speaks a ledger protocol itself. It is handed an
//! [`RpcClient`] per endpoint by a [`ClientFactory`] and only ever calls
//! `call` and `probe` on it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;

use crate::endpoint::EndpointConfig;
use crate::error::RelayError;

/// Aggregate health of a set of endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Every endpoint is healthy.
    Healthy,
    /// Some endpoints are unhealthy.
    Degraded,
    /// No endpoint is healthy.
    Unhealthy,
    /// Nothing has been checked yet (or there are no endpoints).
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A client handle bound to one endpoint.
///
/// # Thread Safety
/// Implementations must be `Send + Sync`; one handle may serve several
/// concurrent read-only calls.
///
/// # Object Safety
/// The trait is object-safe and is stored as `Arc<dyn RpcClient>`.
#[async_trait]
pub trait RpcClient: Send + Sync + 'static {
    /// Invoke `method` with positional `params` and return the raw result.
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RelayError>;

    /// Cheap liveness call. Returns the measured round trip.
    async fn probe(&self) -> Result<Duration, RelayError> {
        let start = Instant::now();
        self.call("getSlot", vec![]).await?;
        Ok(start.elapsed())
    }

    /// The endpoint URL this handle talks to.
    fn url(&self) -> &str;
}

/// Typed convenience on top of [`RpcClient::call`].
#[async_trait]
pub trait RpcClientExt: RpcClient {
    async fn call_as<T: DeserializeOwned + Send + 'static>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, RelayError> {
        let value = self.call(method, params).await?;
        serde_json::from_value(value).map_err(RelayError::from)
    }
}

#[async_trait]
impl<C: RpcClient + ?Sized> RpcClientExt for C {}

/// Creates client handles for endpoints. Used by the pool and the health monitor.
pub trait ClientFactory: Send + Sync + 'static {
    fn create(&self, endpoint: &EndpointConfig) -> Result<Arc<dyn RpcClient>, RelayError>;
}
