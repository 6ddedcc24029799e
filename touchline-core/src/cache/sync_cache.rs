//! Snapshots of provider facts kept by the match state synchronizer.

use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use touchline_sdk::objects::matches::{MatchFields, MatchScout};
use touchline_sdk::objects::{MatchState, Role};

use super::memory::LruTtl;

/// Typed, bounded cache for external data.
///
/// A trailing view only: entries may be missing or stale at any time and
/// the database is consulted whenever an entry is absent.
pub struct SyncCache<K, V> {
    inner: Mutex<LruTtl<K, V>>,
    ttl: Option<Duration>,
}

impl<K: Eq + Hash + Clone, V: Clone> SyncCache<K, V> {
    pub fn new(max_entries: usize, ttl: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(LruTtl::new(max_entries)),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruTtl<K, V>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.lock().get(key, Instant::now())
    }

    pub fn update(&self, key: K, value: V) {
        self.lock().insert(key, value, self.ttl, Instant::now());
    }

    pub fn remove(&self, key: &K) -> bool {
        self.lock().remove(key)
    }
}

/// Cached view of a match.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCacheData {
    pub fields: MatchFields,
    pub scouts: Vec<MatchScout>,
    pub state: MatchState,
    /// Stored state revision this snapshot corresponds to.
    pub state_revision: i64,
}

impl MatchCacheData {
    pub fn is_fields_changed(&self, fields: &MatchFields) -> bool {
        &self.fields != fields
    }

    /// Compares scout rosters ignoring order.
    pub fn is_scouts_changed(&self, scouts: &[MatchScout]) -> bool {
        if self.scouts.len() != scouts.len() {
            return true;
        }
        let key = |s: &MatchScout| (s.scout_number, s.user_id, s.is_main_scout, s.name.clone());
        let mut old: Vec<_> = self.scouts.iter().map(key).collect();
        let mut new: Vec<_> = scouts.iter().map(key).collect();
        old.sort();
        new.sort();
        old != new
    }
}

/// Cached view of a user provisioned from provider data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCacheData {
    pub name: String,
    pub role: Role,
    pub scout_number: Option<i32>,
}
