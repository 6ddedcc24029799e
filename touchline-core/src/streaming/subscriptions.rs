//! Reference-counted per-user pub/sub subscriptions.
//!
//! The first connection of a user starts one task that listens on the
//! user's counters channel and fans every update out through the
//! [`ConnectionRegistry`]; the last release stops it.

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use dashmap::DashMap;
use prost::Message;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use touchline_sdk::objects::UserId;
use touchline_sdk::objects::proto::{ServerUpdate, UnreadCountersUpdate, server_update};
use touchline_sdk::objects::ws::WsCloseCode;
use tracing::{debug, info, warn};

use super::{ConnectionRegistry, GatewayError};
use crate::counters::counters_channel;

/// Source of raw pub/sub payloads.
#[async_trait]
pub trait UpdateSubscriber: Send + Sync + 'static {
    /// Payloads published on `channel`. The stream ends when the backend
    /// connection is lost.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Vec<u8>>, GatewayError>;
}

/// [`UpdateSubscriber`] over Redis pub/sub; one connection per channel.
#[derive(Clone)]
pub struct RedisSubscriber {
    client: redis::Client,
}

impl RedisSubscriber {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UpdateSubscriber for RedisSubscriber {
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Vec<u8>>, GatewayError> {
        let connection = self.client.get_async_connection().await?;
        let mut pubsub = connection.into_pubsub();
        pubsub.subscribe(channel).await?;
        Ok(pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec())
            .boxed())
    }
}

/// Decode a counters payload into the update pushed to sockets.
///
/// Malformed payloads and payloads without a user are dropped.
pub fn decode_counters(payload: &[u8]) -> Option<(UserId, ServerUpdate)> {
    let update = match UnreadCountersUpdate::decode(payload) {
        Ok(update) => update,
        Err(e) => {
            warn!(error = %e, "Dropping undecodable counters update");
            return None;
        }
    };
    let Some(user_id) = update.user_id else {
        warn!("Dropping counters update without user id");
        return None;
    };
    Some((user_id, server_update::Update::UnreadCounters(update).into()))
}

/// Subscription state of one user. Retired slots are already out of the
/// map; whoever finds one retired looks the user up again.
#[derive(Default)]
struct Slot {
    refs: usize,
    task: Option<JoinHandle<()>>,
    retired: bool,
}

type Slots = Arc<DashMap<UserId, Arc<Mutex<Slot>>>>;

fn retire(slots: &Slots, user_id: UserId, slot: &Arc<Mutex<Slot>>, guard: &mut Slot) {
    guard.retired = true;
    guard.refs = 0;
    slots.remove_if(&user_id, |_, current| Arc::ptr_eq(current, slot));
}

pub struct SubscriptionManager {
    subscriber: Arc<dyn UpdateSubscriber>,
    registry: ConnectionRegistry,
    slots: Slots,
}

impl SubscriptionManager {
    pub fn new(subscriber: Arc<dyn UpdateSubscriber>, registry: ConnectionRegistry) -> Self {
        Self {
            subscriber,
            registry,
            slots: Arc::new(DashMap::new()),
        }
    }

    /// Take a reference on the subscription of `user_id`, starting it if
    /// this is the first one.
    ///
    /// Subscribing holds only the user's own slot, so a slow backend delays
    /// that user alone.
    pub async fn acquire(&self, user_id: UserId) -> Result<(), GatewayError> {
        loop {
            let slot = self.slots.entry(user_id).or_default().clone();
            let mut guard = slot.lock().await;
            if guard.retired {
                continue;
            }
            if guard.task.is_some() {
                guard.refs += 1;
                return Ok(());
            }
            let stream = match self.subscriber.subscribe(&counters_channel(user_id)).await {
                Ok(stream) => stream,
                Err(e) => {
                    retire(&self.slots, user_id, &slot, &mut guard);
                    return Err(e);
                }
            };
            guard.task = Some(tokio::spawn(relay(
                user_id,
                stream,
                self.registry.clone(),
                self.slots.clone(),
                slot.clone(),
            )));
            guard.refs = 1;
            debug!(user_id, "Subscribed to counters channel");
            return Ok(());
        }
    }

    /// Drop a reference; the last one stops the subscription.
    pub async fn release(&self, user_id: UserId) {
        let Some(slot) = self.slots.get(&user_id).map(|entry| entry.value().clone()) else {
            return;
        };
        let mut guard = slot.lock().await;
        if guard.retired || guard.task.is_none() {
            return;
        }
        guard.refs = guard.refs.saturating_sub(1);
        if guard.refs == 0 {
            if let Some(task) = guard.task.take() {
                task.abort();
            }
            retire(&self.slots, user_id, &slot, &mut guard);
            debug!(user_id, "Unsubscribed from counters channel");
        }
    }

    pub async fn is_subscribed(&self, user_id: UserId) -> bool {
        let Some(slot) = self.slots.get(&user_id).map(|entry| entry.value().clone()) else {
            return false;
        };
        let guard = slot.lock().await;
        !guard.retired && guard.task.is_some()
    }

    /// Stop every subscription.
    pub async fn shutdown(&self) {
        let slots: Vec<_> = self
            .slots
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        for (user_id, slot) in slots {
            let mut guard = slot.lock().await;
            if let Some(task) = guard.task.take() {
                task.abort();
            }
            retire(&self.slots, user_id, &slot, &mut guard);
        }
        info!("All counter subscriptions stopped");
    }
}

async fn relay(
    user_id: UserId,
    mut stream: BoxStream<'static, Vec<u8>>,
    registry: ConnectionRegistry,
    slots: Slots,
    slot: Arc<Mutex<Slot>>,
) {
    while let Some(payload) = stream.next().await {
        let Some((target, update)) = decode_counters(&payload) else {
            continue;
        };
        registry.deliver(target, &update, None).await;
    }
    warn!(user_id, "Counters subscription lost");
    {
        let mut guard = slot.lock().await;
        guard.task = None;
        retire(&slots, user_id, &slot, &mut guard);
    }
    registry
        .close_user(user_id, WsCloseCode::INTERNAL_ERROR, "pub/sub connection lost")
        .await;
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    /// Hands out one in-memory stream per channel and counts subscriptions.
    #[derive(Default)]
    pub(crate) struct FakeSubscriber {
        senders: StdMutex<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>,
        pub subscribed: StdMutex<u32>,
    }

    impl FakeSubscriber {
        pub(crate) fn publish(&self, channel: &str, update: UnreadCountersUpdate) {
            let senders = self.senders.lock().unwrap();
            senders[channel].send(update.encode_to_vec()).unwrap();
        }

        pub(crate) fn disconnect(&self, channel: &str) {
            self.senders.lock().unwrap().remove(channel);
        }
    }

    #[async_trait]
    impl UpdateSubscriber for FakeSubscriber {
        async fn subscribe(
            &self,
            channel: &str,
        ) -> Result<BoxStream<'static, Vec<u8>>, GatewayError> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.senders.lock().unwrap().insert(channel.to_string(), tx);
            *self.subscribed.lock().unwrap() += 1;
            Ok(UnboundedReceiverStream::new(rx).boxed())
        }
    }
}
