//! Domain controllers.
//!
//! Every mutating operation follows the same sequence: database writes
//! inside one transaction, commit, then system messages, then bus events.
//! The rows are the record of truth; messages and events are derived from
//! them and may be lost on a crash between commit and publish.
//!
//! Operations are methods of [`Messenger`], split by area:
//! - [`chats`]: personal chat lifecycle, membership, reads
//! - [`matches`]: match projection, on-demand indexing, match chats
//! - [`messages`]: history, sending, read marks, typing
//! - [`tickets`]: ticket lifecycle

pub mod chats;
pub mod matches;
pub mod messages;
pub mod tickets;

#[cfg(test)]
pub(crate) mod testing;

use kanau::processor::Processor;
use std::sync::Arc;
use thiserror::Error;
use touchline_sdk::objects::updates::{ServiceUpdate, UpdateKind};
use touchline_sdk::objects::{ChatId, MessageContent, Role, UserId};
use tracing::error;

use crate::bus::{BusError, EventPublisher};
use crate::cache::Cacher;
use crate::config::{ConfigStore, SyncSettings};
use crate::counters::{CounterError, UnreadCounters};
use crate::entities::messages::{InsertMessage, Message};
use crate::entities::unix_seconds;
use crate::entities::users::{GetUserById, User};
use crate::framework::DatabaseProcessor;
use crate::presence::PresenceService;
use crate::processors::match_sync::{MatchStateSynchronizer, SyncError};
use crate::provider::{ProviderError, SportsDataProvider};

/// The authenticated caller of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: UserId, role: Role) -> Self {
        Self { user_id, role }
    }

    pub fn is_supervisor(&self) -> bool {
        self.role == Role::Supervisor
    }
}

/// Failures of controller operations, grouped the way callers map them.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    #[error("not found: {0}")]
    NotFound(&'static str),

    #[error("conflict: {0}")]
    Conflict(&'static str),

    #[error("unprocessable: {0}")]
    Unprocessable(&'static str),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("counter error: {0}")]
    Counters(#[from] CounterError),

    #[error("presence error: {0}")]
    Presence(#[from] redis::RedisError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<SyncError> for ControllerError {
    fn from(value: SyncError) -> Self {
        match value {
            SyncError::NotFound(_) => ControllerError::NotFound("match"),
            SyncError::Database(e) => ControllerError::Database(e),
            SyncError::Provider(e) => ControllerError::Provider(e),
            SyncError::Bus(e) => ControllerError::Bus(e),
            other => ControllerError::Internal(other.to_string()),
        }
    }
}

impl ControllerError {
    /// Whether the failure is the server's fault rather than the caller's.
    pub fn is_internal(&self) -> bool {
        !matches!(
            self,
            ControllerError::Forbidden(_)
                | ControllerError::NotFound(_)
                | ControllerError::Conflict(_)
                | ControllerError::Unprocessable(_)
        )
    }
}

pub type ControllerResult<T> = Result<T, ControllerError>;

/// Handle to everything the controllers touch.
#[derive(Clone)]
pub struct Messenger {
    pub db: DatabaseProcessor,
    pub publisher: Arc<dyn EventPublisher>,
    pub counters: UnreadCounters,
    pub presence: Arc<dyn PresenceService>,
    pub cache: Cacher,
    pub provider: Arc<dyn SportsDataProvider>,
    pub sync: Arc<MatchStateSynchronizer>,
    pub sync_settings: ConfigStore<SyncSettings>,
}

impl Messenger {
    /// Publish a committed change. Failures are logged, never returned: the
    /// change itself already happened.
    pub(crate) async fn announce(&self, update: ServiceUpdate) {
        let update_type = update.update_type();
        if let Err(e) = self.publisher.publish_update(&update).await {
            error!(error = %e, ?update_type, "Failed to publish update");
        }
    }

    /// Append a server-authored message after a commit and announce it.
    pub async fn append_system_message(
        &self,
        chat_id: ChatId,
        content: MessageContent,
        initiator_id: Option<UserId>,
        do_not_increment_counter: bool,
    ) -> ControllerResult<Message> {
        let message = self
            .db
            .process(InsertMessage {
                chat_id,
                sender_id: None,
                content,
                reply_to: None,
            })
            .await?;
        self.announce_message(&message, initiator_id, do_not_increment_counter)
            .await;
        Ok(message)
    }

    /// Resolve a user, provisioning it from the provider on first sight.
    ///
    /// Fails with `Unprocessable` when neither side knows the user.
    pub async fn known_user(&self, user_id: UserId) -> ControllerResult<User> {
        if let Some(user) = self.db.process(GetUserById { user_id }).await? {
            return Ok(user);
        }
        let Some(found) = self.provider.get_user(user_id).await? else {
            return Err(ControllerError::Unprocessable("user not found"));
        };
        let user = User {
            id: found.user_id,
            name: found.name,
            role: found.role.into(),
            scout_number: found.scout_number,
        };
        let mut tx = self.db.pool.begin().await?;
        let changed = User::upsert_tx(&mut tx, &user).await?;
        tx.commit().await?;
        if changed {
            self.announce(ServiceUpdate::now(UpdateKind::UserDataChanged {
                user_id: user.id,
                scout_number: user.scout_number,
                name: user.name.clone(),
                role: user.role.into(),
            }))
            .await;
        }
        Ok(user)
    }

    pub(crate) async fn announce_message(
        &self,
        message: &Message,
        initiator_id: Option<UserId>,
        do_not_increment_counter: bool,
    ) {
        self.announce_message_from(message, initiator_id, do_not_increment_counter, None)
            .await
    }

    pub(crate) async fn announce_message_from(
        &self,
        message: &Message,
        initiator_id: Option<UserId>,
        do_not_increment_counter: bool,
        connection: Option<&str>,
    ) {
        let content_raw = match serde_json::to_string(&message.content.0) {
            Ok(raw) => raw,
            Err(e) => {
                error!(error = %e, message_id = message.id, "Failed to encode message content");
                return;
            }
        };
        let mut update = ServiceUpdate::now(UpdateKind::MessageSent {
            initiator_id,
            message_id: message.id,
            sender_id: message.sender_id,
            chat_id: message.chat_id,
            content_raw,
            msg_created_at: unix_seconds(message.created_at),
            do_not_increment_counter,
        });
        update.cid = connection.map(str::to_owned);
        self.announce(update).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_are_not_internal() {
        assert!(!ControllerError::Forbidden("x").is_internal());
        assert!(!ControllerError::Conflict("x").is_internal());
        assert!(ControllerError::Internal("x".into()).is_internal());
        assert!(ControllerError::Database(sqlx::Error::RowNotFound).is_internal());
    }

    #[test]
    fn test_sync_not_found_maps_to_not_found() {
        let err: ControllerError = SyncError::NotFound(1).into();
        assert!(matches!(err, ControllerError::NotFound("match")));
        let err: ControllerError = SyncError::UnknownStateCode(9).into();
        assert!(matches!(err, ControllerError::Internal(_)));
    }
}
