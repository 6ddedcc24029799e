//! Process-local LRU storage with per-entry TTL.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use super::CacheBackend;

struct Slot<V> {
    value: V,
    expires_at: Option<Instant>,
    tick: u64,
}

/// Bounded map evicting the least recently used entry when full.
///
/// Expired entries are dropped lazily on access.
pub(crate) struct LruTtl<K, V> {
    entries: HashMap<K, Slot<V>>,
    recency: BTreeMap<u64, K>,
    tick: u64,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> LruTtl<K, V> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            tick: 0,
            capacity,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    pub(crate) fn get(&mut self, key: &K, now: Instant) -> Option<V> {
        let expired = match self.entries.get(key) {
            None => return None,
            Some(slot) => slot.expires_at.is_some_and(|at| at <= now),
        };
        if expired {
            self.remove(key);
            return None;
        }

        let tick = self.next_tick();
        let slot = self.entries.get_mut(key)?;
        self.recency.remove(&slot.tick);
        slot.tick = tick;
        self.recency.insert(tick, key.clone());
        Some(slot.value.clone())
    }

    pub(crate) fn insert(&mut self, key: K, value: V, ttl: Option<Duration>, now: Instant) {
        if self.capacity == 0 {
            return;
        }
        self.remove(&key);
        while self.entries.len() >= self.capacity {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }

        let tick = self.next_tick();
        self.recency.insert(tick, key.clone());
        self.entries.insert(
            key,
            Slot {
                value,
                expires_at: ttl.map(|ttl| now + ttl),
                tick,
            },
        );
    }

    pub(crate) fn remove(&mut self, key: &K) -> bool {
        match self.entries.remove(key) {
            Some(slot) => {
                self.recency.remove(&slot.tick);
                true
            }
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// In-memory [`CacheBackend`].
///
/// Holds at most `max_entries` values; values larger than
/// `max_value_size` bytes are not stored.
pub struct InMemoryCache {
    inner: Mutex<LruTtl<String, Arc<[u8]>>>,
    max_value_size: usize,
}

impl InMemoryCache {
    pub fn new(max_entries: usize, max_value_size: usize) -> Self {
        Self {
            inner: Mutex::new(LruTtl::new(max_entries)),
            max_value_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruTtl<String, Arc<[u8]>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheBackend for InMemoryCache {
    fn get(&self, key: &str) -> Option<Arc<[u8]>> {
        self.lock().get(&key.to_string(), Instant::now())
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> bool {
        if value.len() > self.max_value_size {
            return false;
        }
        self.lock()
            .insert(key.to_string(), value.into(), ttl, Instant::now());
        true
    }

    fn delete(&self, key: &str) -> bool {
        self.lock().remove(&key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_least_recently_used_is_evicted() {
        let now = Instant::now();
        let mut lru = LruTtl::new(2);
        lru.insert("a", 1, None, now);
        lru.insert("b", 2, None, now);
        assert_eq!(lru.get(&"a", now), Some(1));
        lru.insert("c", 3, None, now);

        assert_eq!(lru.get(&"b", now), None);
        assert_eq!(lru.get(&"a", now), Some(1));
        assert_eq!(lru.get(&"c", now), Some(3));
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn test_entries_expire() {
        let now = Instant::now();
        let mut lru = LruTtl::new(4);
        lru.insert("a", 1, Some(Duration::from_secs(10)), now);
        assert_eq!(lru.get(&"a", now + Duration::from_secs(9)), Some(1));
        assert_eq!(lru.get(&"a", now + Duration::from_secs(10)), None);
        assert_eq!(lru.len(), 0);
    }

    #[test]
    fn test_reinsert_replaces_without_growing() {
        let now = Instant::now();
        let mut lru = LruTtl::new(2);
        lru.insert("a", 1, None, now);
        lru.insert("a", 2, None, now);
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.get(&"a", now), Some(2));
    }

    #[test]
    fn test_backend_rejects_oversized_values() {
        let cache = InMemoryCache::new(10, 4);
        assert!(!cache.set("k", vec![0; 5], None));
        assert!(cache.get("k").is_none());
        assert!(cache.set("k", vec![0; 4], None));
        assert_eq!(cache.get("k").as_deref(), Some(&[0u8; 4][..]));
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let cache = InMemoryCache::new(0, 1024);
        cache.set("k", vec![1], None);
        assert!(cache.is_empty());
    }
}
