//! The read/write path every call takes:
//!
//! ```text
//! call → RetryExecutor → RateLimiter → RequestDeduplicator → ConnectionPool
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use chainrelay_core::error::RelayError;
use chainrelay_core::policy::{RateLimiter, RequestDeduplicator, RequestParams, RetryExecutor};
use chainrelay_core::pool::ConnectionPool;
use chainrelay_core::request::Commitment;

use crate::fetch::CallOptions;

pub struct RpcPipeline {
    pool: Arc<ConnectionPool>,
    limiter: Arc<RateLimiter>,
    dedup: RequestDeduplicator,
    retry: RetryExecutor,
    request_timeout: Duration,
    queue_timeout: Duration,
    commitment: Commitment,
}

impl RpcPipeline {
    pub fn new(
        pool: Arc<ConnectionPool>,
        limiter: RateLimiter,
        dedup: RequestDeduplicator,
        retry: RetryExecutor,
        request_timeout: Duration,
        queue_timeout: Duration,
        commitment: Commitment,
    ) -> Self {
        Self {
            pool,
            limiter: Arc::new(limiter),
            dedup,
            retry,
            request_timeout,
            queue_timeout,
            commitment,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn dedup(&self) -> &RequestDeduplicator {
        &self.dedup
    }

    /// The commitment reads use when `options` do not set one.
    pub fn commitment(&self, options: &CallOptions) -> Commitment {
        options.commitment.unwrap_or(self.commitment)
    }

    /// The dedup/cache identity of a call.
    pub fn request(&self, method: &str, params: Vec<Value>, options: &CallOptions) -> RequestParams {
        RequestParams::new(method, params).with_commitment(self.commitment(options))
    }

    pub async fn call(&self, request: RequestParams, options: &CallOptions) -> Result<Value, RelayError> {
        self.retry
            .run(|attempt| {
                let request = request.clone();
                async move {
                    if attempt > 0 {
                        tracing::debug!(method = %request.method, attempt, "retrying call");
                    }
                    self.attempt(request, options).await
                }
            })
            .await
    }

    async fn attempt(&self, request: RequestParams, options: &CallOptions) -> Result<Value, RelayError> {
        // Pick the endpoint up front: the limiter buckets by its provider.
        let endpoint = self
            .pool
            .registry()
            .select(options.preferred_endpoint.as_deref())
            .ok_or(RelayError::NoHealthyEndpoint)?;
        let provider = chainrelay_providers::provider_key(&endpoint.config);
        let url = endpoint.config.url;
        // A pinned call only shares a response fetched from the same endpoint.
        let request = match options.preferred_endpoint {
            Some(_) => request.with_option("endpoint", json!(url)),
            None => request,
        };

        self.limiter
            .acquire(&provider, options.priority, self.queue_timeout)
            .await?;

        let pool = self.pool.clone();
        let limiter = self.limiter.clone();
        let timeout = self.request_timeout;
        let method = request.method.clone();
        let params = request.params.clone();
        // Only the caller that reaches the network reports to the limiter.
        self.dedup
            .execute(&request, timeout, move || async move {
                let result = pool.call(Some(&url), &method, params, timeout).await;
                limiter.record_outcome(&provider, &result);
                result
            })
            .await
    }
}
