//! Hot-reloadable settings.
//!
//! A [`ConfigStore`] hands out cheap `Arc` snapshots so that a handler
//! processing one message sees a single consistent version even if a reload
//! happens mid-flight.

use std::sync::Arc;
use tokio::sync::watch;

/// Shared, replaceable settings value.
pub struct ConfigStore<T> {
    tx: Arc<watch::Sender<Arc<T>>>,
}

impl<T> ConfigStore<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _) = watch::channel(Arc::new(initial));
        Self { tx: Arc::new(tx) }
    }

    /// Current settings.
    pub fn snapshot(&self) -> Arc<T> {
        self.tx.borrow().clone()
    }

    /// Replace the settings. Snapshots taken earlier keep the old value.
    pub fn update(&self, value: T) {
        self.tx.send_replace(Arc::new(value));
    }
}

impl<T> Clone for ConfigStore<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_is_visible_to_clones() {
        let store = ConfigStore::new(1u32);
        let clone = store.clone();
        let old = store.snapshot();

        clone.update(2);

        assert_eq!(*old, 1);
        assert_eq!(*store.snapshot(), 2);
    }
}
