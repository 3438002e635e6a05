//! Connection pool: per-endpoint client handles bounded by `max_concurrency`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde_json::Value;

use crate::endpoint::{Endpoint, EndpointRegistry};
use crate::error::RelayError;
use crate::transport::{ClientFactory, RpcClient};

/// Request counters and handle counts.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub active_handles: usize,
    pub endpoints_with_handles: usize,
}

/// Lends client handles bound to the best healthy endpoint.
///
/// Below an endpoint's `max_concurrency` a new handle is created; at the bound
/// an existing one is returned at random. Handles are shared, never exclusive.
pub struct ConnectionPool {
    registry: Arc<EndpointRegistry>,
    factory: Arc<dyn ClientFactory>,
    handles: Mutex<HashMap<String, Vec<Arc<dyn RpcClient>>>>,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
}

impl ConnectionPool {
    pub fn new(registry: Arc<EndpointRegistry>, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            registry,
            factory,
            handles: Mutex::new(HashMap::new()),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// A handle for `endpoint`.
    pub fn acquire(&self, endpoint: &Endpoint) -> Result<Arc<dyn RpcClient>, RelayError> {
        let mut handles = self.handles.lock().unwrap();
        let list = handles.entry(endpoint.config.url.clone()).or_default();
        if list.len() < endpoint.config.max_concurrency.max(1) {
            let handle = self.factory.create(&endpoint.config)?;
            list.push(handle.clone());
            tracing::trace!(url = %endpoint.config.url, handles = list.len(), "created client handle");
            return Ok(handle);
        }
        let idx = rand::thread_rng().gen_range(0..list.len());
        Ok(list[idx].clone())
    }

    /// Select the best healthy endpoint (honouring `preferred`) and acquire a handle.
    pub fn acquire_best(
        &self,
        preferred: Option<&str>,
    ) -> Result<(Endpoint, Arc<dyn RpcClient>), RelayError> {
        let endpoint = self
            .registry
            .select(preferred)
            .ok_or(RelayError::NoHealthyEndpoint)?;
        let handle = self.acquire(&endpoint)?;
        Ok((endpoint, handle))
    }

    /// Run one call against the best endpoint, bounded by `timeout`.
    pub async fn call(
        &self,
        preferred: Option<&str>,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, RelayError> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let result = async {
            let (endpoint, client) = self.acquire_best(preferred)?;
            tracing::debug!(method, url = %endpoint.config.url, "dispatching call");
            tokio::time::timeout(timeout, client.call(method, params))
                .await
                .map_err(|_| RelayError::timeout(timeout))?
        }
        .await;
        if result.is_err() {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Drop every handle held for `url`.
    pub fn evict(&self, url: &str) -> usize {
        self.handles
            .lock()
            .unwrap()
            .remove(url)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Remove an endpoint from the registry together with its handles.
    pub fn remove_endpoint(&self, url: &str) -> bool {
        self.evict(url);
        self.registry.remove_endpoint(url)
    }

    pub fn handle_count(&self, url: &str) -> usize {
        self.handles
            .lock()
            .unwrap()
            .get(url)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> PoolStats {
        let handles = self.handles.lock().unwrap();
        PoolStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            active_handles: handles.values().map(Vec::len).sum(),
            endpoints_with_handles: handles.values().filter(|v| !v.is_empty()).count(),
        }
    }

    pub fn reset_stats(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.failed_requests.store(0, Ordering::Relaxed);
    }
}
