//! Process-wide table of open gateway connections.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use touchline_sdk::objects::UserId;
use touchline_sdk::objects::proto::ServerUpdate;
use tracing::{debug, warn};
use uuid::Uuid;

/// Outbound queue slots per connection.
pub const CONNECTION_BUFFER: usize = 64;

pub type ConnectionId = Uuid;

/// What the socket task of a connection is told to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Update(ServerUpdate),
    Close { code: u16, reason: &'static str },
}

/// A registered connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    /// Users reachable through this connection.
    pub users: HashSet<UserId>,
    sender: mpsc::Sender<Outbound>,
}

/// Open connections keyed by id.
///
/// Only the gateway mutates the registry; senders are cloned out before any
/// await so no shard lock is held across a send.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<ConnectionId, ConnectionInfo>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection of `user_id` and return the queue its socket
    /// task drains.
    pub fn register(&self, user_id: UserId) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_BUFFER);
        let id = Uuid::new_v4();
        self.connections.insert(
            id,
            ConnectionInfo {
                id,
                users: HashSet::from([user_id]),
                sender,
            },
        );
        debug!(connection_id = %id, user_id, "Connection registered");
        (id, receiver)
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<ConnectionInfo> {
        self.connections.remove(id).map(|(_, info)| info)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connections through which `user_id` is reachable.
    pub fn connections_of(&self, user_id: UserId) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|entry| entry.users.contains(&user_id))
            .map(|entry| entry.id)
            .collect()
    }

    fn senders_of(
        &self,
        user_id: Option<UserId>,
        skip: Option<&str>,
    ) -> Vec<(ConnectionId, mpsc::Sender<Outbound>)> {
        self.connections
            .iter()
            .filter(|entry| user_id.is_none_or(|u| entry.users.contains(&u)))
            .filter(|entry| skip.is_none_or(|cid| entry.id.to_string() != cid))
            .map(|entry| (entry.id, entry.sender.clone()))
            .collect()
    }

    /// Push `update` to every connection reaching `user_id`, except the
    /// connection `skip` names. Returns the number of connections served.
    pub async fn deliver(&self, user_id: UserId, update: &ServerUpdate, skip: Option<&str>) -> usize {
        self.send_all(self.senders_of(Some(user_id), skip), Outbound::Update(update.clone()))
            .await
    }

    /// Push `update` to every open connection.
    pub async fn broadcast(&self, update: &ServerUpdate) -> usize {
        self.send_all(self.senders_of(None, None), Outbound::Update(update.clone()))
            .await
    }

    /// Ask every connection reaching `user_id` to close.
    pub async fn close_user(&self, user_id: UserId, code: u16, reason: &'static str) -> usize {
        self.send_all(self.senders_of(Some(user_id), None), Outbound::Close { code, reason })
            .await
    }

    /// Ask every open connection to close.
    pub async fn close_all(&self, code: u16, reason: &'static str) -> usize {
        self.send_all(self.senders_of(None, None), Outbound::Close { code, reason })
            .await
    }

    async fn send_all(
        &self,
        targets: Vec<(ConnectionId, mpsc::Sender<Outbound>)>,
        outbound: Outbound,
    ) -> usize {
        let mut served = 0;
        for (id, sender) in targets {
            if sender.send(outbound.clone()).await.is_ok() {
                served += 1;
            } else {
                warn!(connection_id = %id, "Connection queue closed, dropping it");
                self.connections.remove(&id);
            }
        }
        served
    }
}
