//! Bounded customer-context cache.
//!
//! LRU-bounded mapping from customer key to an opaque context document,
//! with a TTL, per-key access counts for hot-customer reporting, and a
//! negative-lookup filter that short-circuits reads for keys known to be
//! absent. Entries are never mutated in place; a refresh replaces the
//! document wholesale.
//!
//! Concurrency is a single mutex over the whole structure: one map
//! operation per lock hold, which the read-path latency budget allows.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

mod negative;

pub use negative::NegativeFilter;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub ttl: Duration,
    /// Sizing inputs for the negative filter.
    pub negative_expected_keys: usize,
    pub negative_fp_rate: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl: Duration::from_secs(300),
            negative_expected_keys: 10_000,
            negative_fp_rate: 0.01,
        }
    }
}

/// Per-customer opaque context document plus its last-written timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct ContextEntry {
    pub document: serde_json::Value,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub negative_hits: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub negative_keys: usize,
}

struct Slot {
    entry: ContextEntry,
    stored: Instant,
    last_used_seq: u64,
    access_count: u64,
}

struct CacheInner {
    map: HashMap<String, Slot>,
    /// Use-sequence → key; the smallest sequence is the LRU victim.
    lru: BTreeMap<u64, String>,
    seq: u64,
    negative: NegativeFilter,
    negative_created: Instant,
    hits: u64,
    misses: u64,
    negative_hits: u64,
    evictions: u64,
    expirations: u64,
}

impl CacheInner {
    fn touch(&mut self, key: &str) -> u64 {
        self.seq += 1;
        let seq = self.seq;
        if let Some(slot) = self.map.get_mut(key) {
            self.lru.remove(&slot.last_used_seq);
            slot.last_used_seq = seq;
        }
        self.lru.insert(seq, key.to_string());
        seq
    }

    fn remove(&mut self, key: &str) {
        if let Some(slot) = self.map.remove(key) {
            self.lru.remove(&slot.last_used_seq);
        }
    }
}

pub struct ContextCache {
    cfg: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl ContextCache {
    pub fn new(cfg: CacheConfig) -> Self {
        let negative = NegativeFilter::new(cfg.negative_expected_keys, cfg.negative_fp_rate);
        Self {
            cfg,
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                lru: BTreeMap::new(),
                seq: 0,
                negative,
                negative_created: Instant::now(),
                hits: 0,
                misses: 0,
                negative_hits: 0,
                evictions: 0,
                expirations: 0,
            }),
        }
    }

    /// Look up a customer's context.
    ///
    /// The negative filter is consulted first; a filter hit returns
    /// without touching the inner map. A miss or an expired entry records
    /// the key in the negative filter.
    pub fn get(&self, key: &str) -> Option<ContextEntry> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.maybe_expire_filter(&mut inner);

        if inner.negative.contains(key) {
            inner.negative_hits += 1;
            return None;
        }

        let expired = match inner.map.get(key) {
            Some(slot) => slot.stored.elapsed() >= self.cfg.ttl,
            None => {
                inner.misses += 1;
                inner.negative.insert(key);
                return None;
            }
        };
        if expired {
            inner.remove(key);
            inner.expirations += 1;
            inner.misses += 1;
            inner.negative.insert(key);
            return None;
        }

        inner.touch(key);
        let slot = inner.map.get_mut(key).expect("slot present after touch");
        slot.access_count += 1;
        let entry = slot.entry.clone();
        inner.hits += 1;
        Some(entry)
    }

    /// Insert or replace a customer's context wholesale.
    pub fn set(&self, key: &str, document: serde_json::Value) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.maybe_expire_filter(&mut inner);

        // A write for a key the filter claims absent would otherwise stay
        // hidden forever; membership cannot be removed, so clear it all.
        if inner.negative.contains(key) {
            inner.negative.clear();
            inner.negative_created = Instant::now();
        }

        let preserved_access = inner.map.get(key).map(|s| s.access_count).unwrap_or(0);
        inner.remove(key);
        let seq = inner.touch(key);
        inner.map.insert(
            key.to_string(),
            Slot {
                entry: ContextEntry {
                    document,
                    stored_at: Utc::now(),
                },
                stored: Instant::now(),
                last_used_seq: seq,
                access_count: preserved_access,
            },
        );

        while inner.map.len() > self.cfg.max_entries {
            let Some((&victim_seq, _)) = inner.lru.iter().next() else {
                break;
            };
            let victim = inner.lru.remove(&victim_seq).expect("lru entry present");
            inner.map.remove(&victim);
            inner.evictions += 1;
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.map.clear();
        inner.lru.clear();
        inner.negative.clear();
        inner.negative_created = Instant::now();
    }

    /// The `k` keys with the largest access counts, ties broken by most
    /// recent use. Feeds the background warmer.
    pub fn top_accessed(&self, k: usize) -> Vec<(String, u64)> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut counted: Vec<(&String, u64, u64)> = inner
            .map
            .iter()
            .map(|(key, slot)| (key, slot.access_count, slot.last_used_seq))
            .collect();
        counted.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)));
        counted
            .into_iter()
            .take(k)
            .map(|(key, count, _)| (key.clone(), count))
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        CacheStats {
            entries: inner.map.len(),
            hits: inner.hits,
            misses: inner.misses,
            negative_hits: inner.negative_hits,
            evictions: inner.evictions,
            expirations: inner.expirations,
            negative_keys: inner.negative.len(),
        }
    }

    pub fn close(&self) {
        self.clear();
    }

    /// The filter expires on a coarse wall-clock schedule (one TTL),
    /// independent of per-entry TTL logic, to bound false positives over
    /// long runs.
    fn maybe_expire_filter(&self, inner: &mut CacheInner) {
        if inner.negative_created.elapsed() >= self.cfg.ttl && !inner.negative.is_empty() {
            inner.negative.clear();
            inner.negative_created = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache(max_entries: usize, ttl: Duration) -> ContextCache {
        ContextCache::new(CacheConfig {
            max_entries,
            ttl,
            negative_expected_keys: 1000,
            negative_fp_rate: 0.01,
        })
    }

    #[test]
    fn test_set_then_get_returns_entry_regardless_of_filter_state() {
        let cache = cache(10, Duration::from_secs(60));
        // Prime the negative filter with a miss for this key.
        assert!(cache.get("customer_1").is_none());
        cache.set("customer_1", json!({"plan": "pro"}));
        let entry = cache.get("customer_1").expect("entry after set");
        assert_eq!(entry.document, json!({"plan": "pro"}));
    }

    #[test]
    fn test_repeated_get_is_stable_within_ttl() {
        let cache = cache(10, Duration::from_secs(60));
        cache.set("customer_1", json!({"v": 1}));
        let first = cache.get("customer_1").unwrap();
        let second = cache.get("customer_1").unwrap();
        assert_eq!(first.document, second.document);
        assert_eq!(first.stored_at, second.stored_at);
    }

    #[test]
    fn test_expired_entry_misses_and_enters_negative_filter() {
        let cache = cache(10, Duration::from_millis(30));
        cache.set("customer_1", json!({"v": 1}));
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get("customer_1").is_none());
        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.entries, 0);
        // Second lookup is served by the filter without touching the map.
        assert!(cache.get("customer_1").is_none());
        assert!(cache.stats().negative_hits >= 1);
    }

    #[test]
    fn test_lru_eviction_removes_least_recently_used() {
        let cache = cache(3, Duration::from_secs(60));
        cache.set("a", json!(1));
        cache.set("b", json!(2));
        cache.set("c", json!(3));
        // Touch "a" so "b" becomes the LRU victim.
        cache.get("a");
        cache.set("d", json!(4));
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert!(cache.get("d").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_negative_filter_cleared_by_set_for_filtered_key() {
        let cache = cache(10, Duration::from_secs(60));
        assert!(cache.get("customer_1").is_none());
        assert!(cache.stats().negative_keys > 0);
        cache.set("customer_1", json!({"v": 1}));
        assert_eq!(cache.stats().negative_keys, 0);
    }

    #[test]
    fn test_top_accessed_orders_by_count_then_recency() {
        let cache = cache(10, Duration::from_secs(60));
        cache.set("hot", json!(1));
        cache.set("warm", json!(2));
        cache.set("cold", json!(3));
        for _ in 0..5 {
            cache.get("hot");
        }
        for _ in 0..2 {
            cache.get("warm");
        }
        let top = cache.top_accessed(2);
        assert_eq!(top[0].0, "hot");
        assert_eq!(top[0].1, 5);
        assert_eq!(top[1].0, "warm");
    }

    #[test]
    fn test_refresh_replaces_wholesale_and_keeps_access_count() {
        let cache = cache(10, Duration::from_secs(60));
        cache.set("customer_1", json!({"v": 1}));
        cache.get("customer_1");
        cache.set("customer_1", json!({"v": 2}));
        assert_eq!(cache.get("customer_1").unwrap().document, json!({"v": 2}));
        let top = cache.top_accessed(1);
        // One recorded access before the refresh, one after.
        assert_eq!(top[0].1, 2);
    }

    #[test]
    fn test_clear_empties_everything() {
        let cache = cache(10, Duration::from_secs(60));
        cache.set("customer_1", json!(1));
        cache.get("missing");
        cache.clear();
        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.negative_keys, 0);
    }
}
