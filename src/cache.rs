//! TTL cache with a stale shadow copy and single-flight fills.
//!
//! Every `set` writes two expiry horizons for the same value: `fresh_until`
//! (the resource's TTL) and `stale_until` (the longer stale TTL). Reads
//! through [`TtlCache::get`] only see fresh values; [`TtlCache::get_or_fetch`]
//! falls back to the stale copy when the live fetch errors or overruns the
//! latency budget.
//!
//! Expiry is lazy on read, plus [`TtlCache::sweep`] from a background task.

use dashmap::DashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    fresh_until: Instant,
    stale_until: Instant,
}

struct Inner<V> {
    entries: DashMap<String, Entry<V>>,
    inflight: DashMap<String, Arc<Mutex<()>>>,
    /// Bumped by every invalidation so fills started earlier are discarded.
    generation: AtomicU64,
    stale_ttl: Duration,
    latency_budget: Duration,
}

/// How a value was served.
#[derive(Debug, Clone, PartialEq)]
pub enum Served<V> {
    /// Fresh cached value.
    Hit(V),
    /// Fetched just now (or by a concurrent caller this one waited on).
    Miss(V),
    /// Live path failed or was too slow; this is the last good value.
    Stale { value: V, reason: String },
}

impl<V> Served<V> {
    pub fn value(&self) -> &V {
        match self {
            Self::Hit(v) | Self::Miss(v) | Self::Stale { value: v, .. } => v,
        }
    }

    pub fn into_value(self) -> V {
        match self {
            Self::Hit(v) | Self::Miss(v) | Self::Stale { value: v, .. } => v,
        }
    }

    pub fn stale_reason(&self) -> Option<&str> {
        match self {
            Self::Stale { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

/// Why `get_or_fetch` could not produce any value.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchFailure<E> {
    /// The fetch failed and no stale copy exists.
    Failed(E),
    /// The fetch overran the latency budget and no stale copy exists.
    /// It keeps running and will fill the cache when it completes.
    TimedOut(Duration),
    /// The fetch task panicked.
    Panicked,
}

impl<E: Display> Display for FetchFailure<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(e) => write!(f, "{e}"),
            Self::TimedOut(budget) => write!(f, "no answer within {}ms", budget.as_millis()),
            Self::Panicked => f.write_str("fetch task panicked"),
        }
    }
}

/// Keyed TTL cache. Cloning shares the same storage.
pub struct TtlCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for TtlCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    pub fn new(stale_ttl: Duration, latency_budget: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                inflight: DashMap::new(),
                generation: AtomicU64::new(0),
                stale_ttl,
                latency_budget,
            }),
        }
    }

    /// Fresh value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut evict = false;
        let hit = match self.inner.entries.get(key) {
            Some(entry) if now <= entry.fresh_until => Some(entry.value.clone()),
            Some(entry) => {
                evict = now > entry.stale_until;
                None
            }
            None => None,
        };
        if evict {
            self.inner.entries.remove_if(key, |_, e| now > e.stale_until);
        }
        hit
    }

    /// Value for `key` if still within the stale horizon, fresh or not.
    pub fn get_stale(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        self.inner
            .entries
            .get(key)
            .filter(|e| now <= e.stale_until)
            .map(|e| e.value.clone())
    }

    /// Store `value` fresh for `ttl` and stale for the longer stale TTL.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let now = Instant::now();
        let stale_ttl = self.inner.stale_ttl.max(ttl);
        self.inner.entries.insert(
            key.into(),
            Entry {
                value,
                fresh_until: now + ttl,
                stale_until: now + stale_ttl,
            },
        );
    }

    /// Drop every key matching a glob pattern (`jail:*`, `bans:*`), fresh
    /// and stale copies alike. A pattern that is not valid glob syntax is
    /// treated as an exact key. Returns how many entries were removed.
    pub fn invalidate(&self, pattern: &str) -> usize {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let before = self.inner.entries.len();
        match glob::Pattern::new(pattern) {
            Ok(p) => self.inner.entries.retain(|k, _| !p.matches(k)),
            Err(_) => {
                self.inner.entries.remove(pattern);
            }
        }
        let removed = before.saturating_sub(self.inner.entries.len());
        debug!(pattern = %pattern, removed, "cache invalidated");
        removed
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.entries.clear();
        debug!("cache cleared");
    }

    /// Remove entries past their stale horizon and idle in-flight locks.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.inner.entries.len();
        self.inner.entries.retain(|_, e| now <= e.stale_until);
        self.inner
            .inflight
            .retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_lock().is_err());
        before.saturating_sub(self.inner.entries.len())
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Serve `key` from cache, or run `fetch` once for all concurrent callers.
    ///
    /// The fetch runs on its own task so a caller that gives up at the
    /// latency budget does not cancel it; the result still lands in the
    /// cache for the next reader.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> Result<Served<V>, FetchFailure<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        if let Some(v) = self.get(key) {
            crate::metrics::record_cache_lookup("hit");
            return Ok(Served::Hit(v));
        }

        let lock = self
            .inner
            .inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let fut = fetch();
        let cache = self.clone();
        let owned_key = key.to_string();

        let task = tokio::spawn(async move {
            let _guard = lock.lock_owned().await;
            // Whoever held the lock before us may have filled the key.
            if let Some(v) = cache.get(&owned_key) {
                return Ok((v, false));
            }
            let value = fut.await?;
            if cache.inner.generation.load(Ordering::SeqCst) == generation {
                cache.set(owned_key, value.clone(), ttl);
            }
            Ok((value, true))
        });

        let budget = self.inner.latency_budget;
        let failure = match tokio::time::timeout(budget, task).await {
            Ok(Ok(Ok((value, fetched)))) => {
                crate::metrics::record_cache_lookup(if fetched { "miss" } else { "hit" });
                return Ok(Served::Miss(value));
            }
            Ok(Ok(Err(e))) => FetchFailure::Failed(e),
            Ok(Err(join_err)) => {
                warn!(key = %key, error = %join_err, "cache fetch task failed");
                FetchFailure::Panicked
            }
            Err(_) => FetchFailure::TimedOut(budget),
        };

        match self.get_stale(key) {
            Some(value) => {
                crate::metrics::record_cache_lookup("stale");
                let reason = failure.to_string();
                debug!(key = %key, reason = %reason, "serving stale copy");
                Ok(Served::Stale { value, reason })
            }
            None => {
                crate::metrics::record_cache_lookup("error");
                Err(failure)
            }
        }
    }
}
