//! Bounded TTL + LRU Cache
//!
//! In-memory cache with per-entry TTLs, strict least-recently-used eviction
//! at capacity, tag-based invalidation, and prefetch strategies.
//!
//! # Bounds
//!
//! The entry count never exceeds `max_entries`: an insert into a full cache
//! evicts exactly one entry, the one with the oldest access time. Expired
//! entries are additionally removed on read and by the periodic cleanup
//! sweep.
//!
//! # Reentrancy
//!
//! `get_or_fetch` is not reentrancy-safe: two concurrent misses for the same
//! key may both invoke the fetcher before either result is stored. Request
//! deduplication is a separate collaborator's concern.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Configuration
// =============================================================================

/// Cache sizing and freshness configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Hard bound on the number of entries.
    pub max_entries: NonZeroUsize,
    /// TTL applied when `set` is called without an explicit one.
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            // Checked constant, never zero.
            max_entries: NonZeroUsize::new(500).unwrap_or(NonZeroUsize::MIN),
            default_ttl: Duration::from_secs(300),
        }
    }
}

// =============================================================================
// Entries and statistics
// =============================================================================

/// One cached value with its bookkeeping.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
    tags: HashSet<String>,
    last_access_at: Instant,
    hit_count: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

/// Hit/miss/eviction counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Reads that returned a fresh value.
    pub hits: u64,
    /// Reads that found nothing, or only an expired entry.
    pub misses: u64,
    /// Entries removed to make room at capacity.
    pub evictions: u64,
}

impl CacheStats {
    /// Fraction of reads served from cache, zero when nothing was read.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            {
                self.hits as f64 / total as f64
            }
        }
    }
}

/// Diagnostic view of one entry, as returned by [`FlowCache::export`].
#[derive(Debug, Clone)]
pub struct ExportedEntry<V> {
    /// Entry key.
    pub key: String,
    /// Cached value.
    pub value: V,
    /// Time since insertion.
    pub age: Duration,
    /// Number of hits served.
    pub hits: u64,
}

// =============================================================================
// Prefetch strategies
// =============================================================================

/// Async fetcher used by prefetch strategies.
pub type StrategyFetcher<V> =
    Box<dyn Fn(&str) -> BoxFuture<'static, anyhow::Result<V>> + Send + Sync>;

/// One named prefetch rule: an ordered data record, not a subclass.
///
/// Strategies are consulted in ascending `priority` order; the first enabled
/// strategy whose predicate matches the key wins.
pub struct PrefetchStrategy<V> {
    /// Strategy name, unique within the cache.
    pub name: String,
    /// Lower value wins.
    pub priority: u8,
    /// Disabled strategies are skipped without evaluating the predicate.
    pub enabled: bool,
    /// Decides whether this strategy applies to a key.
    pub predicate: Box<dyn Fn(&str) -> bool + Send + Sync>,
    /// Produces the value to cache.
    pub fetcher: StrategyFetcher<V>,
}

// =============================================================================
// Cache
// =============================================================================

struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    stats: CacheStats,
}

/// Bounded TTL + LRU cache with tags and prefetch.
pub struct FlowCache<V> {
    config: CacheConfig,
    inner: Mutex<CacheInner<V>>,
    strategies: RwLock<Vec<PrefetchStrategy<V>>>,
}

impl<V: Clone + Send + Sync + 'static> FlowCache<V> {
    /// Create a cache with the given configuration.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                stats: CacheStats::default(),
            }),
            strategies: RwLock::new(Vec::new()),
        }
    }

    /// Create a cache with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default())
    }

    /// Insert or replace a value under the default TTL with no tags.
    pub fn set(&self, key: &str, value: V) {
        self.set_with(key, value, self.config.default_ttl, &[]);
    }

    /// Insert or replace a value with an explicit TTL and tag set.
    ///
    /// When the insert would exceed capacity, the least-recently-accessed
    /// entry is evicted first — exactly one eviction per overflow insert.
    pub fn set_with(&self, key: &str, value: V, ttl: Duration, tags: &[&str]) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if !inner.entries.contains_key(key)
            && inner.entries.len() >= self.config.max_entries.get()
        {
            if let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access_at)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&oldest);
                inner.stats.evictions += 1;
            }
        }

        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                inserted_at: now,
                ttl,
                tags: tags.iter().map(|t| (*t).to_string()).collect(),
                last_access_at: now,
                hit_count: 0,
            },
        );
    }

    /// Read a fresh value, touching its recency.
    ///
    /// An expired entry is removed and counted as a miss.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        match inner.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.last_access_at = now;
                entry.hit_count += 1;
                let value = entry.value.clone();
                inner.stats.hits += 1;
                Some(value)
            }
            Some(_) => {
                inner.entries.remove(key);
                inner.stats.misses += 1;
                None
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Check for a fresh entry without touching recency or counters.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Remove one entry. Returns whether it existed.
    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().entries.remove(key).is_some()
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    /// Sweep out all currently-expired entries.
    ///
    /// Returns the number removed. Intended for a periodic timer; see
    /// [`FlowCache::run_cleanup`].
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired(now));
        before - inner.entries.len()
    }

    /// Remove every entry whose tag set contains `tag`.
    ///
    /// Returns the number removed.
    pub fn clear_by_tag(&self, tag: &str) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.tags.contains(tag));
        before - inner.entries.len()
    }

    /// Return the cached value, or fetch, store, and return it.
    ///
    /// A hit never invokes `fetcher`; a miss invokes it exactly once and
    /// stores the result under the default TTL. Fetch errors are propagated
    /// and nothing is stored. Not reentrancy-safe (see module docs).
    ///
    /// # Errors
    ///
    /// Returns whatever error the fetcher produced.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: &str, fetcher: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let value = fetcher().await?;
        self.set(key, value.clone());
        Ok(value)
    }

    /// Register a prefetch strategy, keeping the list ordered by priority.
    pub fn register_strategy(&self, strategy: PrefetchStrategy<V>) {
        let mut strategies = self.strategies.write();
        strategies.push(strategy);
        strategies.sort_by_key(|s| s.priority);
    }

    /// Remove a prefetch strategy by name. Returns whether it existed.
    pub fn remove_strategy(&self, name: &str) -> bool {
        let mut strategies = self.strategies.write();
        let before = strategies.len();
        strategies.retain(|s| s.name != name);
        strategies.len() != before
    }

    /// Enable or disable a strategy by name.
    pub fn set_strategy_enabled(&self, name: &str, enabled: bool) {
        let mut strategies = self.strategies.write();
        if let Some(strategy) = strategies.iter_mut().find(|s| s.name == name) {
            strategy.enabled = enabled;
        }
    }

    /// Prefetch a key through the first matching enabled strategy.
    ///
    /// Does nothing when the key is already cached or no strategy matches.
    /// Fetcher failures are logged and swallowed. Returns whether a value
    /// was stored.
    pub async fn prefetch(&self, key: &str) -> bool {
        if self.has(key) {
            return false;
        }

        let fetch = {
            let strategies = self.strategies.read();
            strategies
                .iter()
                .find(|s| s.enabled && (s.predicate)(key))
                .map(|s| ((s.fetcher)(key), s.name.clone()))
        };

        let Some((future, strategy_name)) = fetch else {
            return false;
        };

        match future.await {
            Ok(value) => {
                self.set(key, value);
                true
            }
            Err(error) => {
                tracing::warn!(key, strategy = %strategy_name, error = %error, "Prefetch failed");
                false
            }
        }
    }

    /// Apply [`FlowCache::prefetch`] to each key. Returns how many stored.
    pub async fn warm_up(&self, keys: &[&str]) -> usize {
        let mut stored = 0;
        for key in keys {
            if self.prefetch(key).await {
                stored += 1;
            }
        }
        stored
    }

    /// Current hit/miss/eviction counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    /// Zero the counters without touching entries.
    pub fn reset_stats(&self) {
        self.inner.lock().stats = CacheStats::default();
    }

    /// Number of entries currently held, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Diagnostic listing of all entries.
    #[must_use]
    pub fn export(&self) -> Vec<ExportedEntry<V>> {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(key, entry)| ExportedEntry {
                key: key.clone(),
                value: entry.value.clone(),
                age: now.duration_since(entry.inserted_at),
                hits: entry.hit_count,
            })
            .collect()
    }

    /// Run the periodic expiry sweep until cancelled.
    pub async fn run_cleanup(
        self: std::sync::Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("Cache cleanup task cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    let removed = self.cleanup();
                    if removed > 0 {
                        tracing::debug!(removed, "Cache cleanup removed expired entries");
                    }
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use proptest::prelude::*;

    use super::*;

    fn small_cache(max: usize) -> FlowCache<String> {
        FlowCache::new(CacheConfig {
            max_entries: NonZeroUsize::new(max).unwrap(),
            default_ttl: Duration::from_secs(60),
        })
    }

    #[test]
    fn set_and_get_round_trip() {
        let cache = small_cache(10);
        cache.set("a", "1".to_string());
        assert_eq!(cache.get("a"), Some("1".to_string()));
    }

    #[test]
    fn sixth_insert_into_five_capacity_evicts_lru() {
        let cache = small_cache(5);
        for key in ["a", "b", "c", "d", "e"] {
            cache.set(key, key.to_string());
            // Distinct access times so LRU ordering is deterministic.
            std::thread::sleep(Duration::from_millis(2));
        }

        // Touch "a" so "b" becomes the least recently accessed.
        let _ = cache.get("a");
        std::thread::sleep(Duration::from_millis(2));

        cache.set("f", "f".to_string());

        assert_eq!(cache.len(), 5);
        assert!(!cache.has("b"), "least-recently-touched entry survives");
        for key in ["a", "c", "d", "e", "f"] {
            assert!(cache.has(key), "{key} missing");
        }
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn upsert_of_existing_key_does_not_evict() {
        let cache = small_cache(2);
        cache.set("a", "1".to_string());
        cache.set("b", "2".to_string());
        cache.set("a", "3".to_string());

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.get("a"), Some("3".to_string()));
    }

    #[test]
    fn entry_expires_after_ttl() {
        let cache = small_cache(10);
        cache.set_with("a", "1".to_string(), Duration::from_millis(40), &[]);
        assert_eq!(cache.get("a"), Some("1".to_string()));

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(cache.get("a"), None);
        // Expired entry was removed on read.
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn has_does_not_touch_recency_or_counters() {
        let cache = small_cache(10);
        cache.set("a", "1".to_string());
        assert!(cache.has("a"));
        assert!(!cache.has("b"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn clear_by_tag_removes_only_tagged_entries() {
        let cache = small_cache(10);
        cache.set_with("ab", "1".to_string(), Duration::from_secs(60), &["A", "B"]);
        cache.set_with("a", "2".to_string(), Duration::from_secs(60), &["A"]);
        cache.set_with("b", "3".to_string(), Duration::from_secs(60), &["B"]);

        let removed = cache.clear_by_tag("A");

        assert_eq!(removed, 2);
        assert!(!cache.has("ab"));
        assert!(!cache.has("a"));
        assert!(cache.has("b"));
    }

    #[test]
    fn cleanup_returns_removed_count() {
        let cache = small_cache(10);
        cache.set_with("a", "1".to_string(), Duration::from_millis(10), &[]);
        cache.set_with("b", "2".to_string(), Duration::from_millis(10), &[]);
        cache.set_with("c", "3".to_string(), Duration::from_secs(60), &[]);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.cleanup(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let cache = small_cache(10);
        cache.set("a", "1".to_string());
        let _ = cache.get("a");
        let _ = cache.get("a");
        let _ = cache.get("missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9);

        cache.reset_stats();
        let stats = cache.stats();
        assert_eq!(stats.hits + stats.misses, 0);
        assert!(stats.hit_rate().abs() < f64::EPSILON);
        assert!(cache.has("a"), "reset_stats must not touch entries");
    }

    #[tokio::test]
    async fn get_or_fetch_hit_never_calls_fetcher() {
        let cache = small_cache(10);
        cache.set("a", "cached".to_string());
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = Arc::clone(&calls);
        let value: Result<String, std::convert::Infallible> = cache
            .get_or_fetch("a", move || async move {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok("fetched".to_string())
            })
            .await;

        assert_eq!(value.unwrap(), "cached");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn get_or_fetch_miss_calls_fetcher_once_and_caches() {
        let cache = small_cache(10);
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = Arc::clone(&calls);
        let value: Result<String, std::convert::Infallible> = cache
            .get_or_fetch("a", move || async move {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok("fetched".to_string())
            })
            .await;

        assert_eq!(value.unwrap(), "fetched");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get("a"), Some("fetched".to_string()));
    }

    #[tokio::test]
    async fn get_or_fetch_error_caches_nothing() {
        let cache = small_cache(10);
        let result: Result<String, &str> = cache.get_or_fetch("a", || async { Err("boom") }).await;
        assert!(result.is_err());
        assert!(!cache.has("a"));
    }

    fn market_strategy(calls: Arc<AtomicUsize>) -> PrefetchStrategy<String> {
        PrefetchStrategy {
            name: "market".to_string(),
            priority: 1,
            enabled: true,
            predicate: Box::new(|key| key.starts_with("market:")),
            fetcher: Box::new(move |key| {
                let calls = Arc::clone(&calls);
                let key = key.to_string();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(format!("value-for-{key}"))
                })
            }),
        }
    }

    #[tokio::test]
    async fn prefetch_uses_first_matching_strategy() {
        let cache = small_cache(10);
        let calls = Arc::new(AtomicUsize::new(0));
        cache.register_strategy(market_strategy(Arc::clone(&calls)));

        assert!(cache.prefetch("market:AAPL").await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            cache.get("market:AAPL"),
            Some("value-for-market:AAPL".to_string())
        );

        // Non-matching key goes nowhere.
        assert!(!cache.prefetch("other:AAPL").await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn prefetch_skips_already_cached_keys() {
        let cache = small_cache(10);
        let calls = Arc::new(AtomicUsize::new(0));
        cache.register_strategy(market_strategy(Arc::clone(&calls)));
        cache.set("market:AAPL", "existing".to_string());

        assert!(!cache.prefetch("market:AAPL").await);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn prefetch_failure_is_swallowed() {
        let cache = small_cache(10);
        cache.register_strategy(PrefetchStrategy {
            name: "failing".to_string(),
            priority: 1,
            enabled: true,
            predicate: Box::new(|_| true),
            fetcher: Box::new(|_| Box::pin(async { Err(anyhow::anyhow!("upstream down")) })),
        });

        assert!(!cache.prefetch("anything").await);
        assert!(!cache.has("anything"));
    }

    #[tokio::test]
    async fn disabled_strategy_is_skipped() {
        let cache = small_cache(10);
        let calls = Arc::new(AtomicUsize::new(0));
        cache.register_strategy(market_strategy(Arc::clone(&calls)));
        cache.set_strategy_enabled("market", false);

        assert!(!cache.prefetch("market:AAPL").await);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn warm_up_counts_stored_keys() {
        let cache = small_cache(10);
        let calls = Arc::new(AtomicUsize::new(0));
        cache.register_strategy(market_strategy(Arc::clone(&calls)));

        let stored = cache.warm_up(&["market:AAPL", "market:MSFT", "other:X"]).await;
        assert_eq!(stored, 2);
    }

    #[test]
    fn remove_strategy_by_name() {
        let cache = small_cache(10);
        let calls = Arc::new(AtomicUsize::new(0));
        cache.register_strategy(market_strategy(calls));

        assert!(cache.remove_strategy("market"));
        assert!(!cache.remove_strategy("market"));
    }

    #[test]
    fn export_lists_entries_with_hits() {
        let cache = small_cache(10);
        cache.set("a", "1".to_string());
        let _ = cache.get("a");

        let exported = cache.export();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].key, "a");
        assert_eq!(exported[0].hits, 1);
    }

    #[tokio::test]
    async fn cleanup_task_stops_on_cancel() {
        let cache = Arc::new(small_cache(10));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(Arc::clone(&cache).run_cleanup(
            Duration::from_millis(10),
            cancel.clone(),
        ));

        cancel.cancel();
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("cleanup task should stop promptly")
            .unwrap();
    }

    proptest! {
        #[test]
        fn len_never_exceeds_capacity(keys in proptest::collection::vec("[a-z]{1,4}", 0..64)) {
            let cache = small_cache(5);
            for key in &keys {
                cache.set(key, key.clone());
                prop_assert!(cache.len() <= 5);
            }
        }
    }
}
