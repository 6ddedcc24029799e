//! Generic caching layer.
//!
//! The cache is a best-effort optimization: every consumer must behave
//! correctly when it is cold or when a value was refused for being too
//! large. Nothing here is ever used as the source of truth.
//!
//! - [`Cacher`] memoizes async calls (`cached_func`, `cached_multi_func`)
//!   over a [`CacheBackend`] and keeps hit/total statistics.
//! - [`InMemoryCache`] is the process-local LRU backend with per-entry TTL.
//! - [`SyncCache`] holds snapshots of provider facts for the match state
//!   synchronizer.

mod key;
mod memory;
mod sync_cache;

pub use key::CacheKey;
pub use memory::InMemoryCache;
pub use sync_cache::{MatchCacheData, SyncCache, UserCacheData};

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

/// Byte-oriented storage behind a [`Cacher`].
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Option<Arc<[u8]>>;

    /// Store `value` under `key`. Returns `false` if the backend declined
    /// to keep it (for example because it exceeds the size limit).
    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> bool;

    fn delete(&self, key: &str) -> bool;
}

/// Running hit statistics of a [`Cacher`].
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    total: AtomicU64,
}

impl CacheStats {
    fn record(&self, hit: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Fraction of lookups served from the cache, `0.0` before any lookup.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.hits() as f64 / total as f64
    }
}

/// Memoizes async computations in a [`CacheBackend`].
///
/// Values are stored as JSON. A value that fails to decode (for example
/// after a type change) is treated as a miss and evicted.
#[derive(Clone)]
pub struct Cacher {
    backend: Arc<dyn CacheBackend>,
    stats: Arc<CacheStats>,
    default_ttl: Option<Duration>,
}

impl Cacher {
    pub fn new(backend: Arc<dyn CacheBackend>, default_ttl: Option<Duration>) -> Self {
        Self {
            backend,
            stats: Arc::new(CacheStats::default()),
            default_ttl,
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Return the cached value for `key`, or run `compute` and cache its
    /// successful result. Errors are never cached.
    pub async fn cached_func<T, E, F, Fut>(&self, key: &CacheKey, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let rendered = key.render();
        if let Some(value) = self.lookup(&rendered) {
            self.stats.record(true);
            return Ok(value);
        }
        self.stats.record(false);

        let value = compute().await?;
        self.store(&rendered, &value, self.default_ttl);
        Ok(value)
    }

    /// Batched variant of [`cached_func`](Self::cached_func).
    ///
    /// Each item is cached under `base` extended with `item_kwarg = item`.
    /// `compute` is called at most once, with the items that missed; items
    /// it does not return are simply absent from the result.
    pub async fn cached_multi_func<K, T, E, F, Fut>(
        &self,
        base: &CacheKey,
        item_kwarg: &'static str,
        items: &[K],
        compute: F,
    ) -> Result<HashMap<K, T>, E>
    where
        K: Display + Eq + Hash + Clone,
        T: Serialize + DeserializeOwned,
        F: FnOnce(Vec<K>) -> Fut,
        Fut: Future<Output = Result<HashMap<K, T>, E>>,
    {
        let mut found = HashMap::with_capacity(items.len());
        let mut missing = Vec::new();
        let mut seen = HashSet::with_capacity(items.len());

        for item in items {
            if !seen.insert(item) {
                continue;
            }
            let rendered = base.clone().kwarg(item_kwarg, item).render();
            match self.lookup::<T>(&rendered) {
                Some(value) => {
                    self.stats.record(true);
                    found.insert(item.clone(), value);
                }
                None => {
                    self.stats.record(false);
                    missing.push(item.clone());
                }
            }
        }

        if missing.is_empty() {
            return Ok(found);
        }

        let computed = compute(missing).await?;
        for (item, value) in computed {
            let rendered = base.clone().kwarg(item_kwarg, &item).render();
            self.store(&rendered, &value, self.default_ttl);
            found.insert(item, value);
        }
        Ok(found)
    }

    /// Drop the entry for `key`. Returns whether an entry existed.
    pub fn invalidate_key(&self, key: &CacheKey) -> bool {
        self.backend.delete(&key.render())
    }

    fn lookup<T: DeserializeOwned>(&self, rendered: &str) -> Option<T> {
        let bytes = self.backend.get(rendered)?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = rendered, error = %e, "Evicting undecodable cache entry");
                self.backend.delete(rendered);
                None
            }
        }
    }

    fn store<T: Serialize>(&self, rendered: &str, value: &T, ttl: Option<Duration>) {
        match serde_json::to_vec(value) {
            Ok(bytes) => {
                self.backend.set(rendered, bytes, ttl);
            }
            Err(e) => warn!(key = rendered, error = %e, "Value is not cacheable"),
        }
    }
}
