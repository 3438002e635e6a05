//! Response cache for read results, with stale fallback.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheConfig {
    /// Entries younger than this are served without a network call.
    #[serde(with = "chainrelay_core::serde_ms", rename = "ttl-ms")]
    pub ttl: Duration,
    /// At the cap the oldest tenth is evicted.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            max_entries: 1000,
        }
    }
}

/// Where a read result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchSource {
    Network,
    Cache,
    /// An expired entry, served because the network path failed.
    StaleCache,
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub evicted: u64,
}

struct CacheEntry {
    value: Value,
    stored_at: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    stale_hits: u64,
    misses: u64,
    evicted: u64,
}

/// Raw RPC results keyed by request fingerprint.
///
/// Expired entries are kept (until evicted) so they can back a failed read.
pub struct ResponseCache {
    config: CacheConfig,
    inner: Mutex<Inner>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// A value stored less than `ttl` ago.
    pub fn get_fresh(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock().unwrap();
        let fresh = inner
            .entries
            .get(key)
            .filter(|e| e.stored_at.elapsed() < self.config.ttl)
            .map(|e| e.value.clone());
        match fresh {
            Some(_) => inner.hits += 1,
            None => inner.misses += 1,
        }
        fresh
    }

    /// Any stored value regardless of age.
    pub fn get_stale(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock().unwrap();
        let value = inner.entries.get(key).map(|e| e.value.clone());
        if value.is_some() {
            inner.stale_hits += 1;
        }
        value
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let mut inner = self.inner.lock().unwrap();
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.config.max_entries {
            let evicted = evict_oldest(&mut inner.entries, self.config.max_entries);
            inner.evicted += evicted as u64;
            tracing::debug!(evicted, "response cache full");
        }
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.lock().unwrap().entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            stale_hits: inner.stale_hits,
            misses: inner.misses,
            evicted: inner.evicted,
        }
    }
}

/// Remove the oldest tenth of `cap` (at least one). Returns how many went.
fn evict_oldest(entries: &mut HashMap<String, CacheEntry>, cap: usize) -> usize {
    let count = (cap / 10).max(1).min(entries.len());
    let mut by_age: Vec<_> = entries
        .iter()
        .map(|(k, e)| (e.stored_at, k.clone()))
        .collect();
    by_age.sort();
    for (_, key) in by_age.into_iter().take(count) {
        entries.remove(&key);
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache(ttl_ms: u64, max_entries: usize) -> ResponseCache {
        ResponseCache::new(CacheConfig {
            ttl: Duration::from_millis(ttl_ms),
            max_entries,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_then_stale() {
        let cache = cache(30_000, 10);
        cache.insert("k", json!(1));
        assert_eq!(cache.get_fresh("k"), Some(json!(1)));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.get_fresh("k"), None);
        assert_eq!(cache.get_stale("k"), Some(json!(1)));

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.stale_hits), (1, 1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn full_cache_evicts_oldest_tenth() {
        let cache = cache(60_000, 20);
        for i in 0..20 {
            cache.insert(format!("k{i}"), json!(i));
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        cache.insert("new", json!("x"));

        assert_eq!(cache.len(), 19);
        assert!(cache.get_stale("k0").is_none());
        assert!(cache.get_stale("k1").is_none());
        assert!(cache.get_stale("k2").is_some());
        assert_eq!(cache.stats().evicted, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn overwriting_does_not_evict() {
        let cache = cache(60_000, 2);
        cache.insert("a", json!(1));
        cache.insert("b", json!(2));
        cache.insert("a", json!(3));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get_fresh("a"), Some(json!(3)));
    }
}
