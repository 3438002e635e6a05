//! Request policies applied around every pooled call.
//!
//! The read path, outermost first:
//! ```text
//! Request → [RetryExecutor] → [RateLimiter] → [RequestDeduplicator] → [ConnectionPool]
//! ```

pub mod dedup;
pub mod rate_limiter;
pub mod retry;

pub use dedup::{DedupConfig, DedupStats, RequestDeduplicator, RequestParams};
pub use rate_limiter::{
    ProviderStats, RateLimitConfig, RateLimiter, RateLimiterConfig, RateLimiterStats,
    RequestPriority,
};
pub use retry::{RetryConfig, RetryExecutor, RetryPolicy};
