//! In-process bus used by tests.
//!
//! Immediate updates are delivered right away; delayed updates are held by
//! a sleeping task, so tests drive them with a paused tokio clock.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use touchline_sdk::objects::updates::ServiceUpdate;

use super::{BusError, EventPublisher};

/// A delivered update together with the delay it was published with.
#[derive(Debug, Clone)]
pub(crate) struct Delivered {
    pub update: ServiceUpdate,
    pub delay: Option<Duration>,
}

pub(crate) struct InMemoryBus {
    tx: mpsc::UnboundedSender<Delivered>,
    rx: Mutex<mpsc::UnboundedReceiver<Delivered>>,
}

impl InMemoryBus {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Everything delivered so far, in delivery order.
    pub(crate) fn drain(&self) -> Vec<Delivered> {
        let mut rx = self.rx.lock().unwrap_or_else(|p| p.into_inner());
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }
}

#[async_trait]
impl EventPublisher for InMemoryBus {
    async fn publish_update(&self, update: &ServiceUpdate) -> Result<(), BusError> {
        let _ = self.tx.send(Delivered {
            update: update.clone(),
            delay: None,
        });
        Ok(())
    }

    async fn publish_delayed_update(
        &self,
        update: &ServiceUpdate,
        delay: Duration,
    ) -> Result<(), BusError> {
        let tx = self.tx.clone();
        let update = update.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Delivered {
                update,
                delay: Some(delay),
            });
        });
        Ok(())
    }
}

/// Let spawned tasks and fired timers run.
pub(crate) async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use touchline_sdk::objects::ChatType;
    use touchline_sdk::objects::updates::UpdateKind;

    #[tokio::test(start_paused = true)]
    async fn test_delayed_update_arrives_only_after_delay() {
        let bus = InMemoryBus::new();
        let update = ServiceUpdate::now(UpdateKind::ChatCreated {
            chat_id: 1,
            chat_type: ChatType::Personal,
            created_by_user_id: None,
            match_id: None,
        });
        bus.publish_delayed_update(&update, Duration::from_secs(5))
            .await
            .unwrap();
        settle().await;

        tokio::time::advance(Duration::from_millis(4_999)).await;
        settle().await;
        assert!(bus.drain().is_empty());

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        let delivered = bus.drain();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].delay, Some(Duration::from_secs(5)));
    }
}
