//! Merges identical concurrent calls into one.
//!
//! A call is identified by a fingerprint over its method, canonicalized params,
//! commitment and options. While a call with the same fingerprint is in flight,
//! later callers await the same shared future and observe the identical value
//! or identical error. Entries are removed when the call settles, when they
//! outlive the dedup window, or when the registry hits its cap.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::RelayError;
use crate::request::Commitment;

/// Keys that never take part in the fingerprint.
const NONDETERMINISTIC_KEYS: &[&str] = &["timeout", "signal", "controller", "abort"];

/// Hex characters kept from the SHA-256 digest.
const FINGERPRINT_LEN: usize = 16;

/// Everything that identifies a logical request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestParams {
    pub method: String,
    pub params: Vec<Value>,
    pub commitment: Option<Commitment>,
    pub options: BTreeMap<String, Value>,
}

impl RequestParams {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            ..Default::default()
        }
    }

    pub fn with_commitment(mut self, commitment: Commitment) -> Self {
        self.commitment = Some(commitment);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Stable identifier for deduplication.
    pub fn fingerprint(&self) -> String {
        let mut canonical = String::new();
        canonical.push_str("{\"commitment\":");
        write_canonical(
            &Value::String(self.commitment.unwrap_or_default().as_str().to_string()),
            &mut canonical,
        );
        canonical.push_str(",\"method\":");
        write_canonical(&Value::String(self.method.clone()), &mut canonical);
        canonical.push_str(",\"options\":");
        let options: serde_json::Map<String, Value> = self
            .options
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        write_canonical(&Value::Object(options), &mut canonical);
        canonical.push_str(",\"params\":");
        write_canonical(&Value::Array(self.params.clone()), &mut canonical);
        canonical.push('}');

        let digest = Sha256::digest(canonical.as_bytes());
        let mut hex = hex::encode(digest);
        hex.truncate(FINGERPRINT_LEN);
        hex
    }
}

/// Deterministic JSON: sorted keys, trimmed strings, nondeterministic keys dropped.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => out.push_str(&Value::String(s.trim().to_string()).to_string()),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map
                .keys()
                .filter(|k| !NONDETERMINISTIC_KEYS.contains(&k.as_str()))
                .collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DedupConfig {
    /// Entries older than this are ignored and swept.
    #[serde(with = "crate::serde_ms", rename = "window-ms")]
    pub window: Duration,
    /// Cap on tracked entries.
    pub max_in_flight: usize,
    #[serde(with = "crate::serde_ms", rename = "sweep-interval-ms")]
    pub sweep_interval: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(5),
            max_in_flight: 500,
            sweep_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DedupStats {
    pub total_requests: u64,
    pub deduplicated_requests: u64,
    pub in_flight: usize,
    pub evicted: u64,
    pub expired: u64,
}

impl DedupStats {
    /// Share of requests served by an existing in-flight call.
    pub fn dedup_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.deduplicated_requests as f64 / self.total_requests as f64
    }
}

type SharedCall = Shared<BoxFuture<'static, Result<Value, RelayError>>>;

struct Entry {
    generation: u64,
    call: SharedCall,
    first_seen: Instant,
    waiters: usize,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<String, Entry>,
    next_generation: u64,
    total: u64,
    deduplicated: u64,
    evicted: u64,
    expired: u64,
}

impl Registry {
    fn sweep(&mut self, now: Instant, window: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.first_seen) < window);
        let removed = before - self.entries.len();
        self.expired += removed as u64;
        removed
    }

    /// Drop the oldest tenth (at least one).
    fn evict_oldest(&mut self) {
        let count = (self.entries.len() / 10).max(1);
        let mut by_age: Vec<(Instant, String)> = self
            .entries
            .iter()
            .map(|(k, e)| (e.first_seen, k.clone()))
            .collect();
        by_age.sort();
        for (_, key) in by_age.into_iter().take(count) {
            self.entries.remove(&key);
        }
        self.evicted += count as u64;
        tracing::debug!(evicted = count, "dedup registry at capacity");
    }
}

/// Shares in-flight calls by fingerprint.
///
/// Must be created inside a Tokio runtime; it spawns the sweep loop.
pub struct RequestDeduplicator {
    registry: Arc<Mutex<Registry>>,
    config: DedupConfig,
    sweep_task: JoinHandle<()>,
}

impl RequestDeduplicator {
    pub fn new(config: DedupConfig) -> Self {
        let registry = Arc::new(Mutex::new(Registry::default()));
        let sweep_registry = Arc::downgrade(&registry);
        let window = config.window;
        let period = config.sweep_interval.max(Duration::from_millis(1));
        let sweep_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = sweep_registry.upgrade() else {
                    break;
                };
                let removed = registry.lock().unwrap().sweep(Instant::now(), window);
                if removed > 0 {
                    tracing::trace!(removed, "swept expired dedup entries");
                }
            }
        });
        Self {
            registry,
            config,
            sweep_task,
        }
    }

    /// Run `f` unless an identical call is already in flight, in which case
    /// wait for that call's result instead. `timeout` bounds `f`.
    pub async fn execute<F, Fut>(
        &self,
        params: &RequestParams,
        timeout: Duration,
        f: F,
    ) -> Result<Value, RelayError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, RelayError>> + Send + 'static,
    {
        let key = params.fingerprint();
        let call = {
            let mut registry = self.registry.lock().unwrap();
            registry.total += 1;
            let now = Instant::now();
            let existing = match registry.entries.get_mut(&key) {
                Some(entry) if now.saturating_duration_since(entry.first_seen) < self.config.window => {
                    entry.waiters += 1;
                    Some(entry.call.clone())
                }
                _ => None,
            };
            match existing {
                Some(call) => {
                    registry.deduplicated += 1;
                    tracing::trace!(fingerprint = %key, method = %params.method, "joined in-flight call");
                    call
                }
                None => {
                    if registry.entries.len() >= self.config.max_in_flight.max(1) {
                        registry.evict_oldest();
                    }
                    let generation = registry.next_generation;
                    registry.next_generation += 1;
                    let call = settle_and_remove(
                        Arc::downgrade(&self.registry),
                        key.clone(),
                        generation,
                        timeout,
                        f,
                    );
                    registry.entries.insert(
                        key,
                        Entry {
                            generation,
                            call: call.clone(),
                            first_seen: now,
                            waiters: 1,
                        },
                    );
                    call
                }
            }
        };
        call.await
    }

    /// `true` if a call with these params would join an in-flight one.
    pub fn would_deduplicate(&self, params: &RequestParams) -> bool {
        let key = params.fingerprint();
        let registry = self.registry.lock().unwrap();
        registry.entries.get(&key).map_or(false, |e| {
            Instant::now().saturating_duration_since(e.first_seen) < self.config.window
        })
    }

    /// Number of callers currently sharing the call for `params`.
    pub fn waiters(&self, params: &RequestParams) -> usize {
        let key = params.fingerprint();
        self.registry
            .lock()
            .unwrap()
            .entries
            .get(&key)
            .map_or(0, |e| e.waiters)
    }

    pub fn in_flight(&self) -> usize {
        self.registry.lock().unwrap().entries.len()
    }

    pub fn stats(&self) -> DedupStats {
        let registry = self.registry.lock().unwrap();
        DedupStats {
            total_requests: registry.total,
            deduplicated_requests: registry.deduplicated,
            in_flight: registry.entries.len(),
            evicted: registry.evicted,
            expired: registry.expired,
        }
    }

    /// Forget every in-flight entry. Calls already running still complete.
    pub fn clear(&self) {
        self.registry.lock().unwrap().entries.clear();
    }
}

impl Drop for RequestDeduplicator {
    fn drop(&mut self) {
        self.sweep_task.abort();
    }
}

/// Wrap `f` so that settling removes its own registry entry.
fn settle_and_remove<F, Fut>(
    registry: Weak<Mutex<Registry>>,
    key: String,
    generation: u64,
    timeout: Duration,
    f: F,
) -> SharedCall
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Value, RelayError>> + Send + 'static,
{
    async move {
        let result = match tokio::time::timeout(timeout, f()).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::timeout(timeout)),
        };
        if let Some(registry) = registry.upgrade() {
            let mut registry = registry.lock().unwrap();
            if registry
                .entries
                .get(&key)
                .map_or(false, |e| e.generation == generation)
            {
                registry.entries.remove(&key);
            }
        }
        result
    }
    .boxed()
    .shared()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    fn balance(account: &str) -> RequestParams {
        RequestParams::new("getBalance", vec![json!(account)])
    }

    #[test]
    fn fingerprint_ignores_key_order_whitespace_and_timeouts() {
        let a = RequestParams::new(
            "getAccountInfo",
            vec![json!("Acc1"), json!({"encoding": "base64", "dataSlice": {"offset": 0, "length": 8}})],
        )
        .with_option("timeout", json!(5000));
        let b = RequestParams::new(
            "getAccountInfo",
            vec![json!("  Acc1 "), json!({"dataSlice": {"length": 8, "offset": 0}, "encoding": "base64", "signal": "x"})],
        )
        .with_commitment(Commitment::Confirmed);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 16);
    }

    #[test]
    fn fingerprint_distinguishes_method_params_and_commitment() {
        let base = balance("Acc1");
        assert_ne!(base.fingerprint(), balance("Acc2").fingerprint());
        assert_ne!(
            base.fingerprint(),
            RequestParams::new("getAccountInfo", vec![json!("Acc1")]).fingerprint()
        );
        assert_ne!(
            base.fingerprint(),
            balance("Acc1").with_commitment(Commitment::Finalized).fingerprint()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_identical_calls_execute_once() {
        let dedup = Arc::new(RequestDeduplicator::new(DedupConfig::default()));
        let calls = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let dedup = dedup.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                dedup
                    .execute(&balance("Acc1"), Duration::from_secs(10), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(json!({"value": 42}))
                    })
                    .await
            }));
        }
        for t in tasks {
            assert_eq!(t.await.unwrap().unwrap(), json!({"value": 42}));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.in_flight(), 0);
        let stats = dedup.stats();
        assert_eq!(stats.deduplicated_requests, 4);
        assert!((stats.dedup_rate() - 0.8).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_share_the_same_error() {
        let dedup = Arc::new(RequestDeduplicator::new(DedupConfig::default()));
        let first = {
            let dedup = dedup.clone();
            tokio::spawn(async move {
                dedup
                    .execute(&balance("Acc1"), Duration::from_secs(10), || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(RelayError::Http { status: 503, body: "busy".into() })
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(dedup.would_deduplicate(&balance("Acc1")));

        let second = dedup
            .execute(&balance("Acc1"), Duration::from_secs(10), || async {
                Ok(json!("should not run"))
            })
            .await;
        let first = first.await.unwrap();
        match (first, second) {
            (Err(RelayError::Http { status: a, body: x }), Err(RelayError::Http { status: b, body: y })) => {
                assert_eq!((a, x), (b, y));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn requests_outside_the_window_are_fresh() {
        let dedup = Arc::new(RequestDeduplicator::new(DedupConfig::default()));
        let calls = Arc::new(AtomicU32::new(0));

        let slow = {
            let dedup = dedup.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                dedup
                    .execute(&balance("Acc1"), Duration::from_secs(60), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok(json!(1))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(6000)).await;
        assert!(!dedup.would_deduplicate(&balance("Acc1")));

        let calls2 = calls.clone();
        let fresh = dedup
            .execute(&balance("Acc1"), Duration::from_secs(60), move || async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(json!(2))
            })
            .await
            .unwrap();
        assert_eq!(fresh, json!(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(slow.await.unwrap().unwrap(), json!(1));
    }

    #[tokio::test(start_paused = true)]
    async fn settled_entry_is_removed_and_hung_call_times_out() {
        let dedup = RequestDeduplicator::new(DedupConfig::default());
        dedup
            .execute(&balance("Acc1"), Duration::from_secs(1), || async { Ok(json!(1)) })
            .await
            .unwrap();
        assert!(!dedup.would_deduplicate(&balance("Acc1")));

        let err = dedup
            .execute(&balance("Acc2"), Duration::from_millis(100), || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(json!(0))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Timeout { ms: 100 }));
        assert_eq!(dedup.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cap_evicts_oldest() {
        let dedup = Arc::new(RequestDeduplicator::new(DedupConfig {
            max_in_flight: 10,
            window: Duration::from_secs(60),
            ..Default::default()
        }));
        let mut pending = Vec::new();
        for i in 0..11 {
            let dedup = dedup.clone();
            pending.push(tokio::spawn(async move {
                dedup
                    .execute(&balance(&format!("Acc{i}")), Duration::from_secs(30), || async {
                        tokio::time::sleep(Duration::from_secs(20)).await;
                        Ok(json!(null))
                    })
                    .await
            }));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(dedup.in_flight(), 10);
        assert_eq!(dedup.stats().evicted, 1);
        assert!(!dedup.would_deduplicate(&balance("Acc0")));
        assert!(dedup.would_deduplicate(&balance("Acc10")));

        dedup.clear();
        assert_eq!(dedup.in_flight(), 0);
        for p in pending {
            p.abort();
        }
    }
}
