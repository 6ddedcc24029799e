//! Connection lifecycle: registry, counter subscriptions and presence.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use touchline_sdk::objects::updates::{ServiceUpdate, UpdateKind};
use touchline_sdk::objects::ws::{SERVER_SHUTDOWN_REASON, WsCloseCode};
use touchline_sdk::objects::{PresenceStatus, UserId};
use tracing::{info, warn};

use super::{ConnectionId, ConnectionRegistry, GatewayError, Outbound, SubscriptionManager};
use crate::bus::EventPublisher;
use crate::presence::PresenceService;

pub struct Gateway {
    registry: ConnectionRegistry,
    subscriptions: SubscriptionManager,
    presence: Arc<dyn PresenceService>,
    events: Arc<dyn EventPublisher>,
    presence_ttl: Duration,
    /// Serialises connect and disconnect of the same user.
    user_locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl Gateway {
    pub fn new(
        registry: ConnectionRegistry,
        subscriptions: SubscriptionManager,
        presence: Arc<dyn PresenceService>,
        events: Arc<dyn EventPublisher>,
        presence_ttl: Duration,
    ) -> Self {
        Self {
            registry,
            subscriptions,
            presence,
            events,
            presence_ttl,
            user_locks: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Register an authenticated connection of `user_id`.
    ///
    /// The first connection of a user announces them online. On error
    /// nothing stays registered.
    pub async fn connect(
        &self,
        user_id: UserId,
    ) -> Result<(ConnectionId, mpsc::Receiver<Outbound>), GatewayError> {
        let guard = self.lock_user(user_id).await;
        let result = self.connect_locked(user_id).await;
        self.unlock_user(user_id, guard);
        result
    }

    async fn connect_locked(
        &self,
        user_id: UserId,
    ) -> Result<(ConnectionId, mpsc::Receiver<Outbound>), GatewayError> {
        let first = self.registry.connections_of(user_id).is_empty();
        let (id, receiver) = self.registry.register(user_id);
        if let Err(e) = self.subscriptions.acquire(user_id).await {
            self.registry.remove(&id);
            return Err(e);
        }
        if let Err(e) = self.presence.mark_online(user_id, self.presence_ttl).await {
            self.registry.remove(&id);
            self.subscriptions.release(user_id).await;
            return Err(e.into());
        }
        if first {
            self.announce_presence(user_id, PresenceStatus::Online).await;
        }
        info!(connection_id = %id, user_id, "Gateway connection opened");
        Ok((id, receiver))
    }

    /// Refresh the presence key on client activity.
    pub async fn touch(&self, user_id: UserId) {
        if let Err(e) = self.presence.mark_online(user_id, self.presence_ttl).await {
            warn!(user_id, error = %e, "Failed to refresh presence");
        }
    }

    /// Deregister a connection. The last connection of a user announces
    /// them offline.
    pub async fn disconnect(&self, id: ConnectionId, user_id: UserId) {
        let guard = self.lock_user(user_id).await;
        self.disconnect_locked(id, user_id).await;
        self.unlock_user(user_id, guard);
    }

    async fn disconnect_locked(&self, id: ConnectionId, user_id: UserId) {
        if self.registry.remove(&id).is_none() {
            return;
        }
        self.subscriptions.release(user_id).await;
        if self.registry.connections_of(user_id).is_empty() {
            if let Err(e) = self.presence.mark_offline(user_id).await {
                warn!(user_id, error = %e, "Failed to clear presence");
            }
            self.announce_presence(user_id, PresenceStatus::Offline).await;
        }
        info!(connection_id = %id, user_id, "Gateway connection closed");
    }

    /// Close every connection with "server shutdown" and stop the
    /// subscriptions.
    pub async fn shutdown(&self) {
        let closed = self
            .registry
            .close_all(WsCloseCode::GOING_AWAY, SERVER_SHUTDOWN_REASON)
            .await;
        self.subscriptions.shutdown().await;
        info!(closed, "Gateway shutdown complete");
    }

    async fn lock_user(&self, user_id: UserId) -> OwnedMutexGuard<()> {
        let lock = self.user_locks.entry(user_id).or_default().clone();
        lock.lock_owned().await
    }

    /// Release the user's lock and drop it once nobody else holds or
    /// awaits it.
    fn unlock_user(&self, user_id: UserId, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.user_locks
            .remove_if(&user_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn announce_presence(&self, user_id: UserId, status: PresenceStatus) {
        let update = ServiceUpdate::now(UpdateKind::PresenceStatusChanged { user_id, status });
        if let Err(e) = self.events.publish_update(&update).await {
            warn!(user_id, error = %e, "Failed to announce presence change");
        }
    }
}
