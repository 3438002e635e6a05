//! Exponential backoff retry with optional jitter and a per-attempt timeout.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Jitter spread applied when `jitter` is enabled: ±10 %.
const JITTER_FRACTION: f64 = 0.1;

/// Configuration for the retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try).
    pub max_retries: u32,
    #[serde(with = "crate::serde_ms", rename = "initial-backoff-ms")]
    pub initial_backoff: Duration,
    /// Caps exponential growth.
    #[serde(with = "crate::serde_ms", rename = "max-backoff-ms")]
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    /// Each attempt races this deadline.
    #[serde(with = "crate::serde_ms", rename = "attempt-timeout-ms")]
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

/// Computes delays; holds no per-call state.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay before the `attempt`-th retry (1-based), without jitter.
    /// `None` once `attempt` exceeds `max_retries`.
    pub fn base_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_retries {
            return None;
        }
        let base_ms = self.config.initial_backoff.as_millis() as f64
            * self.config.multiplier.powi((attempt - 1) as i32);
        let cap_ms = self.config.max_backoff.as_millis() as f64;
        Some(Duration::from_millis(base_ms.min(cap_ms) as u64))
    }

    /// Delay before the `attempt`-th retry with jitter applied, still capped.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        let base = self.base_delay(attempt)?;
        if !self.config.jitter || base.is_zero() {
            return Some(base);
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        let jittered = base.mul_f64(factor).min(self.config.max_backoff);
        Some(jittered)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.config.max_retries
    }
}

/// Runs an operation under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            policy: RetryPolicy::new(config),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.policy.config
    }

    /// Call `op(attempt)` until it succeeds, a non-retryable error occurs, or
    /// `max_retries + 1` attempts have been made.
    ///
    /// Non-retryable errors are returned as-is. Exhaustion returns
    /// [`RelayError::RetriesExhausted`] wrapping the last error.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, RelayError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, RelayError>>,
    {
        let timeout = self.policy.config.attempt_timeout;
        let mut attempt: u32 = 0;
        loop {
            let outcome = match tokio::time::timeout(timeout, op(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(RelayError::timeout(timeout)),
            };
            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !err.is_retryable() {
                return Err(err);
            }
            attempt += 1;
            let Some(delay) = self.policy.next_delay(attempt) else {
                tracing::warn!(attempts = attempt, error = %err, "retries exhausted");
                return Err(RelayError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            };
            tracing::debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after transient error"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
