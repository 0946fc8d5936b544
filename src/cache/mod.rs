//! Typed TTL caches shared across tool kinds
//!
//! One bounded store per `CacheType`, each with its own TTL default and
//! capacity. Reads take the store's shared lock only; recency is tracked
//! with an atomic tick so lookups never need exclusive access. Inserts
//! into a full store evict the least-recently-used entry.

use crate::config::{CacheConfig, StoreConfig};
use crate::models::CacheType;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Longest lifetime an entry can be given, whatever TTL was asked for.
const MAX_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// A cached value. Owned exclusively by its store.
#[derive(Debug)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub cache_type: CacheType,
    pub expires_at: Instant,
    last_access: AtomicU64,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Per-type counters reported by `stats()`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheStats {
    pub cache_type: CacheType,
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub corruptions: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreHealth {
    pub cache_type: CacheType,
    pub degraded: bool,
    pub hit_rate: f64,
    pub eviction_rate: f64,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheHealthReport {
    pub healthy: bool,
    pub stores: Vec<StoreHealth>,
}

struct Store {
    cache_type: CacheType,
    config: StoreConfig,
    entries: RwLock<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    corruptions: AtomicU64,
}

impl Store {
    fn new(cache_type: CacheType, config: StoreConfig) -> Self {
        Self {
            cache_type,
            config,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            corruptions: AtomicU64::new(0),
        }
    }

    fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    fn eviction_rate(&self) -> f64 {
        let inserts = self.inserts.load(Ordering::Relaxed);
        if inserts == 0 {
            0.0
        } else {
            self.evictions.load(Ordering::Relaxed) as f64 / inserts as f64
        }
    }

    /// Drop expired entries. Caller holds the write lock.
    fn purge_locked(&self, entries: &mut HashMap<String, CacheEntry>, now: Instant) -> usize {
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        let purged = before - entries.len();
        self.expirations.fetch_add(purged as u64, Ordering::Relaxed);
        purged
    }
}

/// Process-wide cache, constructed once and shared as `Arc<CacheManager>`.
pub struct CacheManager {
    stores: HashMap<CacheType, Store>,
    config: CacheConfig,
    tick: AtomicU64,
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> Self {
        let stores = CacheType::ALL
            .iter()
            .map(|t| (*t, Store::new(*t, config.store(*t))))
            .collect();

        Self {
            stores,
            config,
            tick: AtomicU64::new(0),
        }
    }

    fn store(&self, cache_type: CacheType) -> &Store {
        // Every CacheType gets a store in `new`
        &self.stores[&cache_type]
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn default_ttl(&self, cache_type: CacheType) -> Duration {
        self.store(cache_type).config.default_ttl
    }

    /// Look up a live entry. Expired entries count as a miss and are removed.
    pub async fn get(&self, cache_type: CacheType, key: &str) -> Option<Value> {
        let store = self.store(cache_type);
        let now = Instant::now();

        let expired = {
            let entries = store.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => {
                    entry.last_access.store(self.next_tick(), Ordering::Relaxed);
                    store.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => true,
                None => false,
            }
        };

        store.misses.fetch_add(1, Ordering::Relaxed);

        if expired {
            let mut entries = store.entries.write().await;
            // Re-check: a writer may have refreshed it in between
            if entries.get(key).map_or(false, |e| !e.is_live(Instant::now())) {
                entries.remove(key);
                store.expirations.fetch_add(1, Ordering::Relaxed);
                debug!(cache_type = %cache_type, key, "Expired cache entry removed");
            }
        }

        None
    }

    /// Typed lookup. A value that fails to deserialize is treated as
    /// corrupted: it is evicted and reported as a miss.
    pub async fn get_as<T: DeserializeOwned>(&self, cache_type: CacheType, key: &str) -> Option<T> {
        let value = self.get(cache_type, key).await?;

        match serde_json::from_value::<T>(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                let store = self.store(cache_type);
                store.corruptions.fetch_add(1, Ordering::Relaxed);
                // The lookup above was counted as a hit; it was not one
                store.hits.fetch_sub(1, Ordering::Relaxed);
                store.misses.fetch_add(1, Ordering::Relaxed);
                store.entries.write().await.remove(key);

                warn!(
                    cache_type = %cache_type,
                    key,
                    error = %e,
                    "Corrupted cache entry evicted"
                );
                None
            }
        }
    }

    /// Insert or overwrite an entry with an explicit TTL.
    pub async fn set(&self, cache_type: CacheType, key: &str, value: Value, ttl: Duration) {
        let store = self.store(cache_type);
        let now = Instant::now();
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            cache_type,
            expires_at: now + ttl.min(MAX_TTL),
            last_access: AtomicU64::new(self.next_tick()),
        };

        let mut entries = store.entries.write().await;

        if !entries.contains_key(key) && entries.len() >= store.config.max_entries {
            store.purge_locked(&mut entries, now);

            if entries.len() >= store.config.max_entries {
                let victim = entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_access.load(Ordering::Relaxed))
                    .map(|(k, _)| k.clone());

                if let Some(victim) = victim {
                    entries.remove(&victim);
                    store.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(cache_type = %cache_type, key = %victim, "LRU eviction");
                }
            }
        }

        entries.insert(key.to_string(), entry);
        store.inserts.fetch_add(1, Ordering::Relaxed);
    }

    /// Insert using the store's default TTL.
    pub async fn set_default(&self, cache_type: CacheType, key: &str, value: Value) {
        let ttl = self.default_ttl(cache_type);
        self.set(cache_type, key, value, ttl).await;
    }

    pub async fn remove(&self, cache_type: CacheType, key: &str) -> bool {
        self.store(cache_type)
            .entries
            .write()
            .await
            .remove(key)
            .is_some()
    }

    /// Clear one store, or every store when `cache_type` is `None`.
    /// Returns the number of entries removed.
    pub async fn clear(&self, cache_type: Option<CacheType>) -> usize {
        let targets: Vec<CacheType> = match cache_type {
            Some(t) => vec![t],
            None => CacheType::ALL.to_vec(),
        };

        let mut removed = 0;
        for t in targets {
            let mut entries = self.store(t).entries.write().await;
            removed += entries.len();
            entries.clear();
        }

        info!(?cache_type, removed, "Cache cleared");
        removed
    }

    /// Drop expired entries from every store.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        for t in CacheType::ALL {
            let store = self.store(t);
            let mut entries = store.entries.write().await;
            purged += store.purge_locked(&mut entries, now);
        }
        purged
    }

    pub async fn stats(&self) -> BTreeMap<CacheType, CacheStats> {
        let mut out = BTreeMap::new();

        for t in CacheType::ALL {
            let store = self.store(t);
            let size = store.entries.read().await.len();

            out.insert(
                t,
                CacheStats {
                    cache_type: t,
                    size,
                    capacity: store.config.max_entries,
                    hits: store.hits.load(Ordering::Relaxed),
                    misses: store.misses.load(Ordering::Relaxed),
                    hit_rate: store.hit_rate(),
                    evictions: store.evictions.load(Ordering::Relaxed),
                    expirations: store.expirations.load(Ordering::Relaxed),
                    corruptions: store.corruptions.load(Ordering::Relaxed),
                },
            );
        }

        out
    }

    /// Informational health report. Never blocks or alters cache operations.
    pub fn health_check(&self) -> CacheHealthReport {
        let stores: Vec<StoreHealth> = CacheType::ALL
            .iter()
            .map(|t| {
                let store = self.store(*t);
                let hit_rate = store.hit_rate();
                let eviction_rate = store.eviction_rate();
                let lookups =
                    store.hits.load(Ordering::Relaxed) + store.misses.load(Ordering::Relaxed);

                let mut reasons = Vec::new();
                if lookups >= self.config.min_samples && hit_rate < self.config.min_hit_rate {
                    reasons.push(format!(
                        "hit rate {:.2} below {:.2}",
                        hit_rate, self.config.min_hit_rate
                    ));
                }
                if eviction_rate > self.config.max_eviction_rate {
                    reasons.push(format!(
                        "eviction rate {:.2} above {:.2}",
                        eviction_rate, self.config.max_eviction_rate
                    ));
                }

                StoreHealth {
                    cache_type: store.cache_type,
                    degraded: !reasons.is_empty(),
                    hit_rate,
                    eviction_rate,
                    reasons,
                }
            })
            .collect();

        for s in stores.iter().filter(|s| s.degraded) {
            warn!(cache_type = %s.cache_type, reasons = ?s.reasons, "Cache store degraded");
        }

        CacheHealthReport {
            healthy: stores.iter().all(|s| !s.degraded),
            stores,
        }
    }

    /// Periodically purge expired entries until the handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let purged = cache.purge_expired().await;
                if purged > 0 {
                    debug!(purged, "Cache sweeper purged expired entries");
                }
            }
        })
    }

    /// Flush every store and log final counters.
    pub async fn shutdown(&self) {
        for (t, s) in self.stats().await {
            info!(
                cache_type = %t,
                size = s.size,
                hit_rate = s.hit_rate,
                evictions = s.evictions,
                "Cache store final stats"
            );
        }
        self.clear(None).await;
    }
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn small_cache(max_entries: usize) -> CacheManager {
        let mut config = CacheConfig::default();
        config.stores.insert(
            CacheType::Quote,
            StoreConfig {
                default_ttl: Duration::from_secs(300),
                max_entries,
            },
        );
        CacheManager::new(config)
    }

    #[tokio::test]
    async fn test_huge_ttl_is_clamped_instead_of_overflowing() {
        let cache = CacheManager::default();
        cache
            .set(CacheType::News, "headlines", json!(["AAPL beats"]), Duration::MAX)
            .await;

        assert_eq!(
            cache.get(CacheType::News, "headlines").await,
            Some(json!(["AAPL beats"]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_live_before_expiry_and_missing_after() {
        let cache = CacheManager::default();
        cache
            .set(CacheType::Quote, "aapl", json!({"price": 189.5}), Duration::from_secs(300))
            .await;

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(
            cache.get(CacheType::Quote, "aapl").await,
            Some(json!({"price": 189.5}))
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get(CacheType::Quote, "aapl").await, None);

        let stats = cache.stats().await;
        let quote = &stats[&CacheType::Quote];
        assert_eq!(quote.hits, 1);
        assert_eq!(quote.misses, 1);
        assert_eq!(quote.size, 0);
        assert_eq!(quote.expirations, 1);
    }

    #[tokio::test]
    async fn test_lru_eviction_prefers_least_recently_used() {
        let cache = small_cache(2);
        cache.set_default(CacheType::Quote, "a", json!(1)).await;
        cache.set_default(CacheType::Quote, "b", json!(2)).await;

        // Touch "a" so "b" becomes the LRU entry
        assert!(cache.get(CacheType::Quote, "a").await.is_some());

        cache.set_default(CacheType::Quote, "c", json!(3)).await;

        assert!(cache.get(CacheType::Quote, "a").await.is_some());
        assert!(cache.get(CacheType::Quote, "b").await.is_none());
        assert!(cache.get(CacheType::Quote, "c").await.is_some());
        assert_eq!(cache.stats().await[&CacheType::Quote].evictions, 1);
    }

    #[tokio::test]
    async fn test_overwrite_does_not_evict() {
        let cache = small_cache(1);
        cache.set_default(CacheType::Quote, "a", json!(1)).await;
        cache.set_default(CacheType::Quote, "a", json!(2)).await;

        assert_eq!(cache.get(CacheType::Quote, "a").await, Some(json!(2)));
        assert_eq!(cache.stats().await[&CacheType::Quote].evictions, 0);
    }

    #[tokio::test]
    async fn test_stores_are_independent() {
        let cache = CacheManager::default();
        cache.set_default(CacheType::Quote, "k", json!("quote")).await;
        cache.set_default(CacheType::News, "k", json!("news")).await;

        assert_eq!(cache.clear(Some(CacheType::Quote)).await, 1);
        assert!(cache.get(CacheType::Quote, "k").await.is_none());
        assert_eq!(cache.get(CacheType::News, "k").await, Some(json!("news")));

        assert_eq!(cache.clear(None).await, 1);
        assert!(cache.get(CacheType::News, "k").await.is_none());
    }

    #[tokio::test]
    async fn test_corrupted_entry_is_evicted_and_missed() {
        #[derive(Debug, Deserialize)]
        struct Quote {
            #[allow(dead_code)]
            price: f64,
        }

        let cache = CacheManager::default();
        cache
            .set_default(CacheType::Quote, "bad", json!({"price": "not-a-number"}))
            .await;

        assert!(cache.get_as::<Quote>(CacheType::Quote, "bad").await.is_none());
        assert!(cache.get(CacheType::Quote, "bad").await.is_none());

        let stats = &cache.stats().await[&CacheType::Quote];
        assert_eq!(stats.corruptions, 1);
        assert_eq!(stats.hits, 0);
    }

    #[tokio::test]
    async fn test_health_check_flags_low_hit_rate() {
        let mut config = CacheConfig::default();
        config.min_samples = 4;
        config.min_hit_rate = 0.5;
        let cache = CacheManager::new(config);

        for i in 0..4 {
            cache.get(CacheType::Search, &format!("missing-{}", i)).await;
        }

        let report = cache.health_check();
        assert!(!report.healthy);
        let search = report
            .stores
            .iter()
            .find(|s| s.cache_type == CacheType::Search)
            .unwrap();
        assert!(search.degraded);
        assert!(report
            .stores
            .iter()
            .filter(|s| s.cache_type != CacheType::Search)
            .all(|s| !s.degraded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_counts_entries() {
        let cache = CacheManager::default();
        cache
            .set(CacheType::News, "old", json!(1), Duration::from_secs(1))
            .await;
        cache
            .set(CacheType::News, "fresh", json!(2), Duration::from_secs(60))
            .await;

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.purge_expired().await, 1);
        assert_eq!(cache.stats().await[&CacheType::News].size, 1);
    }
}
