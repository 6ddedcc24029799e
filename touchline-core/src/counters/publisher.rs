//! Publishes unread counter totals to the per-user pub/sub channel.

use prost::Message;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{CounterStore, counters_channel};
use crate::events::CounterUpdateReceiver;

/// Single consumer of the counter update queue.
pub struct CounterPublisher {
    store: Arc<dyn CounterStore>,
    updates_rx: CounterUpdateReceiver,
    shutdown_rx: watch::Receiver<bool>,
}

impl CounterPublisher {
    pub fn new(
        store: Arc<dyn CounterStore>,
        updates_rx: CounterUpdateReceiver,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            updates_rx,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!("CounterPublisher started");

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("CounterPublisher received shutdown signal");
                        break;
                    }
                }

                update = self.updates_rx.recv() => {
                    let Some(update) = update else {
                        info!("Counter update channel closed");
                        break;
                    };
                    let Some(user_id) = update.user_id else {
                        warn!("Dropping counter update without user id");
                        continue;
                    };
                    let channel = counters_channel(user_id);
                    if let Err(e) = self.store.publish(&channel, update.encode_to_vec()).await {
                        warn!(user_id, error = %e, "Failed to publish unread counters");
                    } else {
                        debug!(user_id, unread_count = update.unread_count, "Published unread counters");
                    }
                }
            }
        }

        info!("CounterPublisher shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::store::fake::InMemoryCounterStore;
    use crate::events::default_counter_update_channel;
    use touchline_sdk::objects::proto::UnreadCountersUpdate;

    #[tokio::test]
    async fn test_publishes_to_user_channel_and_skips_anonymous() {
        let store = Arc::new(InMemoryCounterStore::default());
        let (tx, rx) = default_counter_update_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(CounterPublisher::new(store.clone(), rx, shutdown_rx).run());

        tx.send(UnreadCountersUpdate {
            user_id: None,
            unread_count: 1,
        })
        .await
        .unwrap();
        tx.send(UnreadCountersUpdate {
            user_id: Some(5),
            unread_count: 3,
        })
        .await
        .unwrap();
        drop(tx);
        task.await.unwrap();

        let published = store.published.lock().unwrap().clone();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "unread-counters-updates:5");
        let decoded = UnreadCountersUpdate::decode(published[0].1.as_slice()).unwrap();
        assert_eq!(decoded.unread_count, 3);
    }
}
