//! Memoization caches with LRU eviction and TTL expiry
//!
//! **Why**: Derived UI data (filtered lists, formatted series) is expensive
//! to recompute and cheap to key. A bounded LRU with a TTL keeps the hot
//! values around without ever re-validating them - callers own key
//! correctness, the cache only promises "same key, same value, until TTL".
//!
//! **Used by**: callers via [`MemoCache`] directly or the [`Memoized`]
//! function wrapper
//!
//! # Coalescing
//!
//! `get_or_compute` claims the key before computing so concurrent callers of
//! the same key wait for the one in-flight computation instead of duplicating
//! it (same claim-before-load idea as a frame cache avoiding double decodes).

use std::collections::HashSet;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};
use lru::LruCache;
use serde::Serialize;

use crate::clock::{Clock, SystemClock};

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct MemoConfig {
    /// Entry cap; least-recently-used entries are evicted past it.
    pub max_size: usize,
    /// Entries older than this read as absent. `None` disables expiry.
    pub ttl: Option<Duration>,
}

impl Default for MemoConfig {
    fn default() -> Self {
        Self {
            max_size: 64,
            ttl: Some(Duration::from_secs(300)),
        }
    }
}

/// Read-only cache statistics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// LRU evictions plus TTL expirations.
    pub evictions: u64,
    pub size: usize,
    /// Sum of caller-supplied size estimates over live entries, in bytes.
    /// Only entries stored via `insert_sized` contribute.
    pub estimated_bytes: u64,
}

impl CacheStats {
    /// Hits over total lookups, 0.0 when untouched.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    hits: u64,
    /// Caller-supplied size estimate in bytes, if any.
    size: Option<usize>,
}

struct MemoInner<V> {
    map: LruCache<String, CacheEntry<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
    /// Running total of size estimates for live entries.
    bytes: u64,
}

/// Bounded LRU + TTL cache keyed by strings.
pub struct MemoCache<V: Clone> {
    inner: Mutex<MemoInner<V>>,
    /// Keys with a computation in flight (claim-before-compute).
    pending: Mutex<HashSet<String>>,
    cond: Condvar,
    clock: Arc<dyn Clock>,
    config: MemoConfig,
}

impl<V: Clone> MemoCache<V> {
    pub fn new(config: MemoConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: MemoConfig, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(config.max_size)
            .unwrap_or_else(|| NonZeroUsize::new(64).expect("nonzero"));
        Self {
            inner: Mutex::new(MemoInner {
                map: LruCache::new(capacity),
                hits: 0,
                misses: 0,
                evictions: 0,
                bytes: 0,
            }),
            pending: Mutex::new(HashSet::new()),
            cond: Condvar::new(),
            clock,
            config,
        }
    }

    /// Look up a key, promoting it to most-recently-used. An entry past its
    /// TTL reads as a miss and is evicted on the spot.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        if let Some(entry) = inner.map.get_mut(key) {
            let expired = self
                .config
                .ttl
                .is_some_and(|ttl| now.saturating_duration_since(entry.inserted_at) >= ttl);
            if !expired {
                entry.hits += 1;
                inner.hits += 1;
                return Some(entry.value.clone());
            }
            if let Some(old) = inner.map.pop(key) {
                inner.bytes -= old.size.unwrap_or(0) as u64;
            }
            inner.evictions += 1;
            debug!("cache key '{}' expired", key);
        }
        inner.misses += 1;
        None
    }

    /// Store a value, evicting the least-recently-used entry at capacity.
    pub fn insert(&self, key: &str, value: V) {
        self.insert_entry(key, value, None);
    }

    /// Store a value with a size estimate (bytes). Estimates are summed into
    /// [`CacheStats::estimated_bytes`] so hosts can watch cache weight.
    pub fn insert_sized(&self, key: &str, value: V, size: usize) {
        self.insert_entry(key, value, Some(size));
    }

    fn insert_entry(&self, key: &str, value: V, size: Option<usize>) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        inner.bytes += size.unwrap_or(0) as u64;
        let evicted = inner.map.push(
            key.to_string(),
            CacheEntry {
                value,
                inserted_at: now,
                hits: 0,
                size,
            },
        );
        if let Some((old_key, old)) = evicted {
            inner.bytes -= old.size.unwrap_or(0) as u64;
            if old_key != key {
                inner.evictions += 1;
                debug!("cache evicted '{}' for '{}'", old_key, key);
            }
        }
    }

    /// Get the cached value or compute it. Concurrent calls for the same key
    /// coalesce: later callers block until the in-flight computation lands,
    /// then read the cached result instead of recomputing.
    pub fn get_or_compute<F>(&self, key: &str, f: F) -> V
    where
        F: FnOnce() -> V,
    {
        loop {
            if let Some(value) = self.get(key) {
                return value;
            }
            let mut pending = self.pending.lock().unwrap();
            if pending.insert(key.to_string()) {
                break; // our claim, we compute
            }
            // Someone else is computing this key.
            let _pending = self.cond.wait(pending).unwrap();
        }

        let _claim = ClaimGuard { cache: self, key };
        let value = f();
        self.insert(key, value.clone());
        value
    }

    /// Non-promoting existence check, TTL-aware.
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now();
        let inner = self.inner.lock().unwrap();
        inner.map.peek(key).is_some_and(|entry| {
            !self
                .config
                .ttl
                .is_some_and(|ttl| now.saturating_duration_since(entry.inserted_at) >= ttl)
        })
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.clear();
        inner.bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().map.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            size: inner.map.len(),
            estimated_bytes: inner.bytes,
        }
    }
}

/// Releases the pending claim and wakes waiters, also on panic in `f`.
struct ClaimGuard<'a, V: Clone> {
    cache: &'a MemoCache<V>,
    key: &'a str,
}

impl<V: Clone> Drop for ClaimGuard<'_, V> {
    fn drop(&mut self) {
        let mut pending = self.cache.pending.lock().unwrap();
        pending.remove(self.key);
        self.cache.cond.notify_all();
    }
}

/// Default key generation: the serde_json rendering of the arguments.
///
/// Arguments that fail to serialize fall back to a degenerate per-type key,
/// so all unserializable values of one type share a cache slot. A known
/// correctness relaxation - callers with such arguments should supply a
/// custom key function.
pub fn memo_key<T: Serialize + ?Sized>(args: &T) -> String {
    match serde_json::to_string(args) {
        Ok(key) => key,
        Err(e) => {
            warn!(
                "memo key serialization failed ({}), falling back to type key",
                e
            );
            format!("<unserializable:{}>", std::any::type_name::<T>())
        }
    }
}

/// Order-insensitive key for commutative argument sets.
///
/// Each element is keyed independently, the per-element keys are sorted, and
/// the sorted list is serialized - `[a, b]` and `[b, a]` land on one cache
/// slot. For pairwise operations (intersections, merges, diffs) where the
/// operand order does not change the result.
pub fn memo_key_commutative<T: Serialize>(args: &[T]) -> String {
    let mut parts: Vec<String> = args.iter().map(|a| memo_key(a)).collect();
    parts.sort_unstable();
    memo_key(&parts)
}

/// A unary function wrapped with a [`MemoCache`].
///
/// Assumes referential transparency for a given key: the cache never
/// re-validates beyond TTL expiry.
pub struct Memoized<A, V, F>
where
    A: Serialize,
    V: Clone,
    F: FnMut(&A) -> V,
{
    cache: MemoCache<V>,
    func: F,
    key_fn: Option<Box<dyn Fn(&A) -> String + Send>>,
    _args: PhantomData<fn(&A)>,
}

impl<A, V, F> Memoized<A, V, F>
where
    A: Serialize,
    V: Clone,
    F: FnMut(&A) -> V,
{
    pub fn new(func: F) -> Self {
        Self::with_config(func, MemoConfig::default())
    }

    pub fn with_config(func: F, config: MemoConfig) -> Self {
        Self {
            cache: MemoCache::new(config),
            func,
            key_fn: None,
            _args: PhantomData,
        }
    }

    /// Use a custom key function instead of serde-based key generation.
    pub fn with_key_fn<K>(func: F, config: MemoConfig, key_fn: K) -> Self
    where
        K: Fn(&A) -> String + Send + 'static,
    {
        Self {
            cache: MemoCache::new(config),
            func,
            key_fn: Some(Box::new(key_fn)),
            _args: PhantomData,
        }
    }

    pub fn call(&mut self, args: &A) -> V {
        let key = match &self.key_fn {
            Some(key_fn) => key_fn(args),
            None => memo_key(args),
        };
        if let Some(value) = self.cache.get(&key) {
            return value;
        }
        let value = (self.func)(args);
        self.cache.insert(&key, value.clone());
        value
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear(&self) {
        self.cache.clear();
    }
}

/// Shorthand for a serde-keyed [`Memoized`] with default config.
pub fn memoize<A, V, F>(func: F) -> Memoized<A, V, F>
where
    A: Serialize,
    V: Clone,
    F: FnMut(&A) -> V,
{
    Memoized::new(func)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::manual_clock;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn ttl_cache(ttl_ms: u64) -> (Arc<crate::clock::ManualClock>, MemoCache<String>) {
        let (clock, handle) = manual_clock();
        let cache = MemoCache::with_clock(
            MemoConfig {
                max_size: 8,
                ttl: Some(Duration::from_millis(ttl_ms)),
            },
            handle,
        );
        (clock, cache)
    }

    #[test]
    fn test_get_after_insert_before_ttl() {
        let (clock, cache) = ttl_cache(100);
        cache.insert("k", "v".to_string());

        clock.advance_ms(99);
        assert_eq!(cache.get("k"), Some("v".to_string()));
    }

    #[test]
    fn test_ttl_expiry_reads_as_miss() {
        let (clock, cache) = ttl_cache(100);
        cache.insert("k", "v".to_string());

        clock.advance_ms(100);
        assert_eq!(cache.get("k"), None);
        assert!(!cache.contains("k"));

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.size, 0);
    }

    #[test]
    fn test_lru_evicts_least_recently_used() {
        let cache: MemoCache<i32> = MemoCache::new(MemoConfig {
            max_size: 2,
            ttl: None,
        });
        cache.insert("a", 1);
        cache.insert("b", 2);

        // Touch "a" so "b" is the LRU entry.
        assert_eq!(cache.get("a"), Some(1));
        cache.insert("c", 3);

        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_hit_rate() {
        let cache: MemoCache<i32> = MemoCache::new(MemoConfig::default());
        cache.insert("k", 7);

        cache.get("k");
        cache.get("k");
        cache.get("missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_replacing_same_key_is_not_an_eviction() {
        let cache: MemoCache<i32> = MemoCache::new(MemoConfig {
            max_size: 2,
            ttl: None,
        });
        cache.insert("a", 1);
        cache.insert("a", 2);
        assert_eq!(cache.get("a"), Some(2));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_memo_key_serializes_args() {
        assert_eq!(memo_key(&(1, "x")), r#"[1,"x"]"#);
        assert_eq!(memo_key(&(1, "x")), memo_key(&(1, "x")));
        assert_ne!(memo_key(&(1, "x")), memo_key(&(2, "x")));
    }

    #[test]
    fn test_memo_key_degenerate_fallback() {
        // Non-string map keys fail JSON serialization; both values collapse
        // to the same per-type key.
        let mut a: HashMap<Vec<u32>, u32> = HashMap::new();
        a.insert(vec![1], 1);
        let mut b: HashMap<Vec<u32>, u32> = HashMap::new();
        b.insert(vec![2], 2);

        let ka = memo_key(&a);
        let kb = memo_key(&b);
        assert!(ka.starts_with("<unserializable:"));
        assert_eq!(ka, kb);
    }

    #[test]
    fn test_memo_key_commutative_ignores_order() {
        assert_eq!(
            memo_key_commutative(&[1, 2, 3]),
            memo_key_commutative(&[3, 1, 2])
        );
        assert_ne!(
            memo_key_commutative(&[1, 2, 3]),
            memo_key_commutative(&[1, 2, 4])
        );
        assert_eq!(
            memo_key_commutative(&["b", "a"]),
            memo_key_commutative(&["a", "b"])
        );
    }

    #[test]
    fn test_size_estimates_tracked_across_evictions() {
        let cache: MemoCache<Vec<u8>> = MemoCache::new(MemoConfig {
            max_size: 2,
            ttl: None,
        });
        cache.insert_sized("a", vec![0; 100], 100);
        cache.insert_sized("b", vec![0; 40], 40);
        assert_eq!(cache.stats().estimated_bytes, 140);

        // Replacing a key swaps its estimate, no eviction counted.
        cache.insert_sized("b", vec![0; 60], 60);
        assert_eq!(cache.stats().estimated_bytes, 160);
        assert_eq!(cache.stats().evictions, 0);

        // Capacity eviction of "a" releases its estimate.
        cache.insert_sized("c", vec![0; 10], 10);
        assert_eq!(cache.stats().estimated_bytes, 70);

        cache.clear();
        assert_eq!(cache.stats().estimated_bytes, 0);
    }

    #[test]
    fn test_size_estimate_released_on_ttl_expiry() {
        let (clock, cache) = ttl_cache(100);
        cache.insert_sized("k", "v".to_string(), 32);
        assert_eq!(cache.stats().estimated_bytes, 32);

        clock.advance_ms(100);
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.stats().estimated_bytes, 0);
    }

    #[test]
    fn test_get_or_compute_coalesces_concurrent_calls() {
        let cache: Arc<MemoCache<u64>> = Arc::new(MemoCache::new(MemoConfig::default()));
        let computations = Arc::new(AtomicUsize::new(0));

        thread::scope(|scope| {
            for _ in 0..4 {
                let cache = Arc::clone(&cache);
                let computations = Arc::clone(&computations);
                scope.spawn(move || {
                    let value = cache.get_or_compute("series", || {
                        computations.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(100));
                        42
                    });
                    assert_eq!(value, 42);
                });
            }
        });

        assert_eq!(computations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_memoized_wrapper_caches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let mut cached = memoize(move |n: &u32| {
            calls2.fetch_add(1, Ordering::SeqCst);
            n * 2
        });

        assert_eq!(cached.call(&21), 42);
        assert_eq!(cached.call(&21), 42);
        assert_eq!(cached.call(&10), 20);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let stats = cached.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[test]
    fn test_memoized_custom_key_fn() {
        // Key on length only: strings of equal length share a slot.
        let mut cached = Memoized::with_key_fn(
            |s: &String| s.to_uppercase(),
            MemoConfig::default(),
            |s: &String| s.len().to_string(),
        );

        assert_eq!(cached.call(&"abc".to_string()), "ABC");
        assert_eq!(cached.call(&"xyz".to_string()), "ABC"); // stale by design
    }
}
