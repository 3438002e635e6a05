//! Per-provider token bucket rate limiter with a priority wait queue.
//!
//! Tokens refill continuously at `requests / window`, capped at `burst_limit`.
//! A request runs immediately when a whole token is available and nothing is
//! queued ahead of it. Otherwise it waits in the provider's queue, ordered by
//! [`RequestPriority`] and FIFO within a tier, until a background drain loop
//! admits it or its deadline passes.
//!
//! A provider-reported rate-limit error puts the provider into exponential
//! backoff: no admissions until `backoff_until`, the delay doubling on each
//! consecutive violation up to `max_backoff`, reset by the next success.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::RelayError;

/// Wait samples kept for the average-wait statistic.
const WAIT_SAMPLES: usize = 100;

/// Queue priority. Lower value is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestPriority {
    Critical = 0,
    High = 1,
    #[default]
    Medium = 2,
    Low = 3,
}

/// Limits for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RateLimitConfig {
    /// Requests allowed per `window`.
    pub requests: u32,
    #[serde(with = "crate::serde_ms", rename = "window-ms")]
    pub window: Duration,
    /// Bucket capacity.
    pub burst_limit: u32,
    #[serde(with = "crate::serde_ms", rename = "base-backoff-ms")]
    pub base_backoff: Duration,
    #[serde(with = "crate::serde_ms", rename = "max-backoff-ms")]
    pub max_backoff: Duration,
}

impl RateLimitConfig {
    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        let secs = self.window.as_secs_f64();
        if secs <= 0.0 {
            return f64::INFINITY;
        }
        self.requests as f64 / secs
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.requests == 0 || self.burst_limit == 0 || self.window.is_zero() {
            return Err(RelayError::Config(
                "rate limit needs requests, burst-limit and window above zero".into(),
            ));
        }
        if self.base_backoff > self.max_backoff {
            return Err(RelayError::Config(
                "rate limit base-backoff exceeds max-backoff".into(),
            ));
        }
        Ok(())
    }
}

/// Limiter-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RateLimiterConfig {
    /// Limits keyed by provider.
    pub providers: HashMap<String, RateLimitConfig>,
    /// Applied to providers absent from `providers`. `None` lets them pass through.
    pub default_limit: Option<RateLimitConfig>,
    #[serde(with = "crate::serde_ms", rename = "tick-interval-ms")]
    pub tick_interval: Duration,
    /// Total queued requests across all providers.
    pub max_queue_size: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
            default_limit: None,
            tick_interval: Duration::from_millis(50),
            max_queue_size: 1000,
        }
    }
}

impl RateLimiterConfig {
    pub fn validate(&self) -> Result<(), RelayError> {
        for cfg in self.providers.values().chain(self.default_limit.iter()) {
            cfg.validate()?;
        }
        if self.tick_interval.is_zero() {
            return Err(RelayError::Config("rate limiter tick interval must be > 0".into()));
        }
        Ok(())
    }
}

/// Per-provider view in [`RateLimiterStats`].
#[derive(Debug, Clone, Default)]
pub struct ProviderStats {
    pub available_tokens: f64,
    pub requests_in_window: usize,
    pub queued: usize,
    pub backoff_remaining: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    /// Currently waiting.
    pub queued_requests: usize,
    /// Requests that could not run immediately.
    pub blocked_requests: u64,
    /// Mean queue wait over the most recent admissions.
    pub average_wait: Duration,
    pub providers: BTreeMap<String, ProviderStats>,
}

/// Queue key: priority tier, then arrival sequence.
type QueueKey = (RequestPriority, u64);

struct Waiter {
    enqueued_at: Instant,
    deadline: Instant,
    admit: oneshot::Sender<()>,
}

struct ProviderState {
    config: RateLimitConfig,
    tokens: f64,
    last_refill: Instant,
    backoff_until: Option<Instant>,
    backoff_delay: Duration,
    window: VecDeque<Instant>,
    queue: BTreeMap<QueueKey, Waiter>,
}

impl ProviderState {
    fn new(config: RateLimitConfig, now: Instant) -> Self {
        Self {
            tokens: config.burst_limit as f64,
            config,
            last_refill: now,
            backoff_until: None,
            backoff_delay: Duration::ZERO,
            window: VecDeque::new(),
            queue: BTreeMap::new(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let burst = self.config.burst_limit as f64;
        self.tokens = (self.tokens + elapsed * self.config.refill_rate()).min(burst);
        self.last_refill = now;
    }

    fn is_backing_off(&self, now: Instant) -> bool {
        self.backoff_until.map_or(false, |until| now < until)
    }

    fn consume(&mut self, now: Instant) {
        self.tokens = (self.tokens - 1.0).max(0.0);
        self.window.push_back(now);
        self.prune_window(now);
    }

    fn prune_window(&mut self, now: Instant) {
        while let Some(front) = self.window.front() {
            if now.saturating_duration_since(*front) >= self.config.window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

struct Inner {
    config: RateLimiterConfig,
    providers: HashMap<String, ProviderState>,
    queued: usize,
    next_seq: u64,
    total_requests: u64,
    blocked_requests: u64,
    wait_samples: VecDeque<Duration>,
    shut_down: bool,
}

impl Inner {
    fn limit_for(&self, provider: &str) -> Option<RateLimitConfig> {
        self.config
            .providers
            .get(provider)
            .or(self.config.default_limit.as_ref())
            .cloned()
    }

    fn record_wait(&mut self, waited: Duration) {
        if self.wait_samples.len() == WAIT_SAMPLES {
            self.wait_samples.pop_front();
        }
        self.wait_samples.push_back(waited);
    }

    /// Expire overdue waiters, then admit queue heads while tokens last.
    fn drain(&mut self, now: Instant) {
        let mut admitted = Vec::new();
        for state in self.providers.values_mut() {
            let before = state.queue.len();
            state.queue.retain(|_, w| w.deadline > now);
            self.queued -= before - state.queue.len();

            if state.queue.is_empty() || state.is_backing_off(now) {
                continue;
            }
            state.refill(now);
            while state.tokens >= 1.0 {
                let Some((_, waiter)) = state.queue.pop_first() else {
                    break;
                };
                self.queued -= 1;
                // A dropped receiver means the caller went away; keep the token.
                if waiter.admit.send(()).is_ok() {
                    state.consume(now);
                    admitted.push(now.saturating_duration_since(waiter.enqueued_at));
                }
            }
        }
        for waited in admitted {
            self.record_wait(waited);
        }
    }
}

enum Admission {
    Immediate,
    Queued {
        key: QueueKey,
        deadline: Instant,
        rx: oneshot::Receiver<()>,
    },
}

/// Removes a queued entry if the waiting future is dropped before admission.
struct QueueGuard<'a> {
    inner: &'a Mutex<Inner>,
    provider: &'a str,
    key: QueueKey,
    armed: bool,
}

impl QueueGuard<'_> {
    /// Remove the entry now. Returns `true` if it was still queued.
    fn remove(&mut self) -> bool {
        self.armed = false;
        let mut inner = self.inner.lock().unwrap();
        let removed = inner
            .providers
            .get_mut(self.provider)
            .and_then(|s| s.queue.remove(&self.key))
            .is_some();
        if removed {
            inner.queued -= 1;
        }
        removed
    }
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.remove();
        }
    }
}

/// Token bucket limiter keyed by provider.
///
/// Must be created inside a Tokio runtime; it spawns the drain loop.
pub struct RateLimiter {
    inner: Arc<Mutex<Inner>>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let tick = config.tick_interval.max(Duration::from_millis(1));
        let inner = Arc::new(Mutex::new(Inner {
            config,
            providers: HashMap::new(),
            queued: 0,
            next_seq: 0,
            total_requests: 0,
            blocked_requests: 0,
            wait_samples: VecDeque::with_capacity(WAIT_SAMPLES),
            shut_down: false,
        }));

        let loop_inner = inner.clone();
        let drain_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                loop_inner.lock().unwrap().drain(Instant::now());
            }
        });

        Self {
            inner,
            drain_task: Mutex::new(Some(drain_task)),
        }
    }

    /// Run `f` once `provider` admits it.
    ///
    /// `timeout` bounds only the time spent queued. A queued request past its
    /// deadline fails with [`RelayError::RateLimited`]; so does any request
    /// arriving while the queue is full.
    pub async fn execute<T, F, Fut>(
        &self,
        provider: &str,
        priority: RequestPriority,
        timeout: Duration,
        f: F,
    ) -> Result<T, RelayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RelayError>>,
    {
        self.acquire(provider, priority, timeout).await?;
        let result = f().await;
        self.record_outcome(provider, &result);
        result
    }

    /// Wait for `provider` to admit one request without running anything.
    ///
    /// Pair with [`record_outcome`](Self::record_outcome) once per upstream
    /// call, so that callers sharing one response do not report it twice.
    pub async fn acquire(
        &self,
        provider: &str,
        priority: RequestPriority,
        timeout: Duration,
    ) -> Result<(), RelayError> {
        if let Admission::Queued { key, deadline, mut rx } =
            self.admit(provider, priority, timeout)?
        {
            let mut guard = QueueGuard {
                inner: &self.inner,
                provider,
                key,
                armed: true,
            };
            match tokio::time::timeout_at(deadline, &mut rx).await {
                Ok(Ok(())) => guard.armed = false,
                Ok(Err(_)) => {
                    guard.armed = false;
                    return Err(self.closed_error(provider, timeout));
                }
                Err(_) => {
                    if guard.remove() || rx.try_recv().is_err() {
                        tracing::debug!(provider, ?priority, "queued request timed out");
                        return Err(queue_timeout(provider, timeout));
                    }
                }
            }
        }
        Ok(())
    }

    /// Feed one upstream result into the provider's backoff state.
    pub fn record_outcome<T>(&self, provider: &str, result: &Result<T, RelayError>) {
        match result {
            Ok(_) => self.record_success(provider),
            Err(e) if e.is_rate_limit() => self.record_rate_limit(provider),
            Err(_) => {}
        }
    }

    fn admit(
        &self,
        provider: &str,
        priority: RequestPriority,
        timeout: Duration,
    ) -> Result<Admission, RelayError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.shut_down {
            return Err(RelayError::Shutdown { component: "rate limiter" });
        }
        inner.total_requests += 1;
        let Some(limit) = inner.limit_for(provider) else {
            return Ok(Admission::Immediate);
        };

        let now = Instant::now();
        let state = inner
            .providers
            .entry(provider.to_string())
            .or_insert_with(|| ProviderState::new(limit, now));
        state.refill(now);
        if !state.is_backing_off(now) && state.queue.is_empty() && state.tokens >= 1.0 {
            state.consume(now);
            return Ok(Admission::Immediate);
        }

        inner.blocked_requests += 1;
        if inner.queued >= inner.config.max_queue_size {
            tracing::warn!(provider, queued = inner.queued, "rate limiter queue full");
            return Err(RelayError::RateLimited {
                provider: provider.to_string(),
                reason: format!("queue full ({} waiting)", inner.queued),
            });
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let key = (priority, seq);
        let deadline = now + timeout;
        let (tx, rx) = oneshot::channel();
        if let Some(state) = inner.providers.get_mut(provider) {
            state.queue.insert(
                key,
                Waiter {
                    enqueued_at: now,
                    deadline,
                    admit: tx,
                },
            );
        }
        inner.queued += 1;
        tracing::trace!(provider, ?priority, queued = inner.queued, "request queued");
        Ok(Admission::Queued { key, deadline, rx })
    }

    fn closed_error(&self, provider: &str, timeout: Duration) -> RelayError {
        if self.inner.lock().unwrap().shut_down {
            RelayError::Shutdown { component: "rate limiter" }
        } else {
            queue_timeout(provider, timeout)
        }
    }

    /// Enter (or extend) backoff after a provider signalled throttling.
    pub fn record_rate_limit(&self, provider: &str) {
        let mut inner = self.inner.lock().unwrap();
        let Some(state) = inner.providers.get_mut(provider) else {
            return;
        };
        let now = Instant::now();
        state.backoff_delay = if state.backoff_delay.is_zero() {
            state.config.base_backoff
        } else {
            (state.backoff_delay * 2).min(state.config.max_backoff)
        };
        state.backoff_until = Some(now + state.backoff_delay);
        state.tokens = 0.0;
        state.last_refill = now;
        tracing::warn!(
            provider,
            backoff_ms = state.backoff_delay.as_millis() as u64,
            "provider rate limited, backing off"
        );
    }

    /// Clear backoff after a successful call.
    pub fn record_success(&self, provider: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.providers.get_mut(provider) {
            if !state.backoff_delay.is_zero() {
                tracing::info!(provider, "provider backoff cleared");
            }
            state.backoff_delay = Duration::ZERO;
            state.backoff_until = None;
        }
    }

    /// `true` if a request to `provider` would not run immediately.
    pub fn is_rate_limited(&self, provider: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        match inner.providers.get_mut(provider) {
            Some(state) => {
                state.refill(now);
                state.is_backing_off(now) || !state.queue.is_empty() || state.tokens < 1.0
            }
            None => false,
        }
    }

    /// Rough time until a new request to `provider` would be admitted.
    pub fn estimated_wait(&self, provider: &str) -> Duration {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let Some(state) = inner.providers.get_mut(provider) else {
            return Duration::ZERO;
        };
        if let Some(until) = state.backoff_until.filter(|u| now < *u) {
            return until - now;
        }
        state.refill(now);
        let needed = state.queue.len() as f64 + 1.0 - state.tokens;
        if needed <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(needed / state.config.refill_rate())
    }

    /// Refill the bucket and clear backoff. Queued requests stay queued.
    pub fn reset_provider(&self, provider: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.providers.get_mut(provider) {
            state.tokens = state.config.burst_limit as f64;
            state.last_refill = Instant::now();
            state.backoff_delay = Duration::ZERO;
            state.backoff_until = None;
            state.window.clear();
        }
    }

    /// Replace the limits for one provider.
    pub fn update_config(&self, provider: &str, config: RateLimitConfig) -> Result<(), RelayError> {
        config.validate()?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.providers.get_mut(provider) {
            state.refill(Instant::now());
            state.tokens = state.tokens.min(config.burst_limit as f64);
            state.config = config.clone();
        }
        inner.config.providers.insert(provider.to_string(), config);
        Ok(())
    }

    pub fn stats(&self) -> RateLimiterStats {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let providers = inner
            .providers
            .iter_mut()
            .map(|(name, state)| {
                state.refill(now);
                state.prune_window(now);
                let backoff_remaining = state
                    .backoff_until
                    .map(|u| u.saturating_duration_since(now))
                    .unwrap_or_default();
                (
                    name.clone(),
                    ProviderStats {
                        available_tokens: state.tokens,
                        requests_in_window: state.window.len(),
                        queued: state.queue.len(),
                        backoff_remaining,
                    },
                )
            })
            .collect();
        let average_wait = if inner.wait_samples.is_empty() {
            Duration::ZERO
        } else {
            inner.wait_samples.iter().sum::<Duration>() / inner.wait_samples.len() as u32
        };
        RateLimiterStats {
            total_requests: inner.total_requests,
            queued_requests: inner.queued,
            blocked_requests: inner.blocked_requests,
            average_wait,
            providers,
        }
    }

    /// Stop the drain loop and reject everything queued.
    pub fn shutdown(&self) {
        if let Some(task) = self.drain_task.lock().unwrap().take() {
            task.abort();
        }
        let mut inner = self.inner.lock().unwrap();
        inner.shut_down = true;
        for state in inner.providers.values_mut() {
            state.queue.clear();
        }
        inner.queued = 0;
        tracing::info!("rate limiter shut down");
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Ok(mut task) = self.drain_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

fn queue_timeout(provider: &str, timeout: Duration) -> RelayError {
    RelayError::RateLimited {
        provider: provider.to_string(),
        reason: format!("queued request timed out after {}ms", timeout.as_millis()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(requests: u32, window_ms: u64, burst: u32) -> RateLimitConfig {
        RateLimitConfig {
            requests,
            window: Duration::from_millis(window_ms),
            burst_limit: burst,
            base_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(4000),
        }
    }

    fn limiter(cfg: RateLimitConfig) -> Arc<RateLimiter> {
        let mut providers = HashMap::new();
        providers.insert("devnet".to_string(), cfg);
        Arc::new(RateLimiter::new(RateLimiterConfig {
            providers,
            ..Default::default()
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn third_call_waits_for_refill() {
        let rl = limiter(limit(2, 1000, 2));
        let start = Instant::now();

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let rl = rl.clone();
            tasks.push(tokio::spawn(async move {
                rl.execute("devnet", RequestPriority::Medium, Duration::from_secs(5), || async {
                    Ok::<_, RelayError>(Instant::now())
                })
                .await
                .unwrap()
            }));
        }
        let mut ran_at = Vec::new();
        for t in tasks {
            ran_at.push(t.await.unwrap() - start);
        }
        ran_at.sort();

        assert!(ran_at[0] < Duration::from_millis(10));
        assert!(ran_at[1] < Duration::from_millis(10));
        assert!(ran_at[2] >= Duration::from_millis(500), "third ran at {:?}", ran_at[2]);
        assert!(ran_at[2] < Duration::from_millis(700));
        assert_eq!(rl.stats().blocked_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_never_exceed_burst_or_go_negative() {
        let rl = limiter(limit(10, 1000, 3));
        for _ in 0..3 {
            rl.execute("devnet", RequestPriority::High, Duration::from_secs(1), || async {
                Ok::<_, RelayError>(())
            })
            .await
            .unwrap();
        }
        let tokens = rl.stats().providers["devnet"].available_tokens;
        assert!(tokens >= 0.0 && tokens < 1.0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        let tokens = rl.stats().providers["devnet"].available_tokens;
        assert_eq!(tokens, 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_serves_priority_then_fifo() {
        let rl = limiter(limit(1, 100, 1));
        // Drain the single token so every following call queues.
        rl.execute("devnet", RequestPriority::Medium, Duration::from_secs(1), || async {
            Ok::<_, RelayError>(())
        })
        .await
        .unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for (label, priority) in [
            ("low", RequestPriority::Low),
            ("medium-1", RequestPriority::Medium),
            ("critical", RequestPriority::Critical),
            ("medium-2", RequestPriority::Medium),
        ] {
            let rl = rl.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                rl.execute("devnet", priority, Duration::from_secs(10), || async move {
                    order.lock().unwrap().push(label);
                    Ok::<_, RelayError>(())
                })
                .await
            }));
            // Make enqueue order deterministic.
            tokio::task::yield_now().await;
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(
            *order.lock().unwrap(),
            vec!["critical", "medium-1", "medium-2", "low"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn queued_request_times_out_with_rate_limit_error() {
        let rl = limiter(limit(1, 60_000, 1));
        rl.execute("devnet", RequestPriority::Medium, Duration::from_secs(1), || async {
            Ok::<_, RelayError>(())
        })
        .await
        .unwrap();

        let err = rl
            .execute("devnet", RequestPriority::Medium, Duration::from_millis(200), || async {
                Ok::<_, RelayError>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_rate_limit());
        assert_eq!(rl.stats().queued_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_rejects_immediately() {
        let mut providers = HashMap::new();
        providers.insert("devnet".to_string(), limit(1, 60_000, 1));
        let rl = Arc::new(RateLimiter::new(RateLimiterConfig {
            providers,
            max_queue_size: 1,
            ..Default::default()
        }));
        rl.execute("devnet", RequestPriority::Medium, Duration::from_secs(1), || async {
            Ok::<_, RelayError>(())
        })
        .await
        .unwrap();

        let waiting = {
            let rl = rl.clone();
            tokio::spawn(async move {
                rl.execute("devnet", RequestPriority::Low, Duration::from_secs(30), || async {
                    Ok::<_, RelayError>(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(rl.stats().queued_requests, 1);

        let start = Instant::now();
        let err = rl
            .execute("devnet", RequestPriority::Critical, Duration::from_secs(30), || async {
                Ok::<_, RelayError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::RateLimited { .. }));
        assert_eq!(start.elapsed(), Duration::ZERO);

        rl.shutdown();
        assert!(matches!(
            waiting.await.unwrap(),
            Err(RelayError::Shutdown { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_and_resets_on_success() {
        let rl = limiter(limit(100, 1000, 10));
        let throttled = || async {
            Err::<(), _>(RelayError::Http { status: 429, body: "slow down".into() })
        };

        let _ = rl.execute("devnet", RequestPriority::High, Duration::from_secs(30), throttled).await;
        let first = rl.stats().providers["devnet"].backoff_remaining;
        assert_eq!(first, Duration::from_millis(1000));
        assert!(rl.is_rate_limited("devnet"));

        let _ = rl.execute("devnet", RequestPriority::High, Duration::from_secs(30), throttled).await;
        let second = rl.stats().providers["devnet"].backoff_remaining;
        assert_eq!(second, Duration::from_millis(2000));

        for _ in 0..3 {
            rl.record_rate_limit("devnet");
        }
        assert_eq!(
            rl.stats().providers["devnet"].backoff_remaining,
            Duration::from_millis(4000)
        );

        rl.execute("devnet", RequestPriority::High, Duration::from_secs(30), || async {
            Ok::<_, RelayError>(())
        })
        .await
        .unwrap();
        assert_eq!(rl.stats().providers["devnet"].backoff_remaining, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn shared_response_backs_off_once() {
        let rl = limiter(limit(100, 1000, 10));
        for _ in 0..4 {
            rl.acquire("devnet", RequestPriority::Medium, Duration::from_secs(1))
                .await
                .unwrap();
        }
        // Four admitted callers, one upstream 429.
        let throttled: Result<(), _> = Err(RelayError::Http { status: 429, body: String::new() });
        rl.record_outcome("devnet", &throttled);
        assert_eq!(
            rl.stats().providers["devnet"].backoff_remaining,
            Duration::from_millis(1000)
        );

        rl.record_outcome("devnet", &Err::<(), _>(RelayError::Timeout { ms: 5 }));
        assert_eq!(
            rl.stats().providers["devnet"].backoff_remaining,
            Duration::from_millis(1000)
        );

        rl.record_outcome("devnet", &Ok::<_, RelayError>(()));
        assert_eq!(rl.stats().providers["devnet"].backoff_remaining, Duration::ZERO);
    }

    #[tokio::test]
    async fn unconfigured_provider_passes_through() {
        let rl = limiter(limit(1, 60_000, 1));
        for _ in 0..20 {
            rl.execute("elsewhere", RequestPriority::Low, Duration::from_millis(1), || async {
                Ok::<_, RelayError>(())
            })
            .await
            .unwrap();
        }
        assert!(!rl.is_rate_limited("elsewhere"));
        assert_eq!(rl.estimated_wait("elsewhere"), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_and_update_config() {
        let rl = limiter(limit(1, 60_000, 1));
        rl.execute("devnet", RequestPriority::Medium, Duration::from_secs(1), || async {
            Ok::<_, RelayError>(())
        })
        .await
        .unwrap();
        assert!(rl.is_rate_limited("devnet"));
        assert!(rl.estimated_wait("devnet") > Duration::from_secs(50));

        rl.reset_provider("devnet");
        assert!(!rl.is_rate_limited("devnet"));

        rl.update_config("devnet", limit(5, 1000, 5)).unwrap();
        assert!(rl.update_config("devnet", limit(0, 1000, 5)).is_err());
        assert_eq!(rl.stats().providers["devnet"].available_tokens, 1.0);
    }
}
