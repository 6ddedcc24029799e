//! Service updates exchanged over the message bus.
//!
//! Every state change in the messenger is announced as a [`ServiceUpdate`]
//! after the owning transaction has committed. On the wire it is a flat
//! JSON object tagged by `"type"`:
//!
//! ```json
//! {"type":"CHAT_CREATED","created_at":1718000000,"chat_id":1,"chat_type":"PERSONAL",
//!  "created_by_user_id":3,"match_id":null}
//! ```

use serde::{Deserialize, Serialize};

use super::matches::{MatchFields, MatchScout, MatchSnapshot};
use super::{
    ChatId, ChatType, DeliveryStatus, MatchId, MatchState, MessageId, PresenceStatus, Role,
    TicketId, TicketStatus, UserId,
};

/// Envelope for a single bus event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceUpdate {
    /// Unix timestamp (seconds) at which the event was produced.
    pub created_at: i64,
    /// Connection that caused the update, so fan-out can skip echoing it back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    #[serde(flatten)]
    pub kind: UpdateKind,
}

impl ServiceUpdate {
    /// Wrap `kind` with the current timestamp.
    pub fn now(kind: UpdateKind) -> Self {
        Self {
            created_at: time::OffsetDateTime::now_utc().unix_timestamp(),
            cid: None,
            kind,
        }
    }

    pub fn with_connection(mut self, cid: impl Into<String>) -> Self {
        self.cid = Some(cid.into());
        self
    }

    pub fn update_type(&self) -> UpdateType {
        self.kind.update_type()
    }
}

/// Closed set of bus event kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateKind {
    MessageSent {
        #[serde(default)]
        initiator_id: Option<UserId>,
        message_id: MessageId,
        #[serde(default)]
        sender_id: Option<UserId>,
        chat_id: ChatId,
        /// JSON-encoded [`MessageContent`](super::MessageContent).
        content_raw: String,
        msg_created_at: i64,
        #[serde(default)]
        do_not_increment_counter: bool,
    },
    DeliveryStatusChanged {
        message_id: MessageId,
        chat_id: ChatId,
        user_id: UserId,
        status: DeliveryStatus,
    },
    PresenceStatusChanged {
        user_id: UserId,
        status: PresenceStatus,
    },
    UserIsTyping {
        chat_id: ChatId,
        user_id: UserId,
        is_typing: bool,
    },
    MatchCreated {
        payload: MatchSnapshot,
    },
    MatchDataChanged {
        sportlevel_id: MatchId,
        fields: MatchFields,
    },
    MatchStateChanged {
        sportlevel_id: MatchId,
        old_state: MatchState,
        new_state: MatchState,
        /// Revision of the match state at the time the event was issued.
        /// Consumers drop the event if the stored revision is newer.
        #[serde(default)]
        state_revision: i64,
    },
    MatchScoutsChanged {
        sportlevel_id: MatchId,
        scouts: Vec<MatchScout>,
    },
    UserDataChanged {
        user_id: UserId,
        scout_number: Option<i32>,
        name: String,
        role: Role,
    },
    TicketCreated {
        created_by_user_id: UserId,
        ticket_id: TicketId,
        match_id: Option<MatchId>,
        chat_id: ChatId,
    },
    TicketStatusChanged {
        changed_by_user_id: UserId,
        ticket_id: TicketId,
        old_status: TicketStatus,
        new_status: TicketStatus,
    },
    ChatCreated {
        chat_id: ChatId,
        chat_type: ChatType,
        created_by_user_id: Option<UserId>,
        match_id: Option<MatchId>,
    },
}

/// Discriminant of [`UpdateKind`], used for logging and handler tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateType {
    MessageSent,
    DeliveryStatusChanged,
    PresenceStatusChanged,
    UserIsTyping,
    MatchCreated,
    MatchDataChanged,
    MatchStateChanged,
    MatchScoutsChanged,
    UserDataChanged,
    TicketCreated,
    TicketStatusChanged,
    ChatCreated,
}

impl UpdateKind {
    pub fn update_type(&self) -> UpdateType {
        match self {
            UpdateKind::MessageSent { .. } => UpdateType::MessageSent,
            UpdateKind::DeliveryStatusChanged { .. } => UpdateType::DeliveryStatusChanged,
            UpdateKind::PresenceStatusChanged { .. } => UpdateType::PresenceStatusChanged,
            UpdateKind::UserIsTyping { .. } => UpdateType::UserIsTyping,
            UpdateKind::MatchCreated { .. } => UpdateType::MatchCreated,
            UpdateKind::MatchDataChanged { .. } => UpdateType::MatchDataChanged,
            UpdateKind::MatchStateChanged { .. } => UpdateType::MatchStateChanged,
            UpdateKind::MatchScoutsChanged { .. } => UpdateType::MatchScoutsChanged,
            UpdateKind::UserDataChanged { .. } => UpdateType::UserDataChanged,
            UpdateKind::TicketCreated { .. } => UpdateType::TicketCreated,
            UpdateKind::TicketStatusChanged { .. } => UpdateType::TicketStatusChanged,
            UpdateKind::ChatCreated { .. } => UpdateType::ChatCreated,
        }
    }
}

impl std::fmt::Display for UpdateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// State notification pushed by the sports data provider.
///
/// Only the match id and the provider's raw state code are carried; the
/// synchronizer maps the code through its configured state table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStateNotification {
    pub translation_id: MatchId,
    pub state_id: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_created_wire_format() {
        let update = ServiceUpdate {
            created_at: 1_718_000_000,
            cid: None,
            kind: UpdateKind::ChatCreated {
                chat_id: 1,
                chat_type: ChatType::Personal,
                created_by_user_id: Some(3),
                match_id: None,
            },
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["type"], "CHAT_CREATED");
        assert_eq!(json["chat_type"], "PERSONAL");
        assert_eq!(json["created_at"], 1_718_000_000);
        assert!(json.get("cid").is_none());
    }

    #[test]
    fn test_state_changed_without_revision_defaults_to_zero() {
        let raw = r#"{"type":"MATCH_STATE_CHANGED","created_at":5,"sportlevel_id":42,
            "old_state":"LIVE","new_state":"FINISHED"}"#;
        let update: ServiceUpdate = serde_json::from_str(raw).unwrap();
        match update.kind {
            UpdateKind::MatchStateChanged {
                sportlevel_id,
                state_revision,
                new_state,
                ..
            } => {
                assert_eq!(sportlevel_id, 42);
                assert_eq!(state_revision, 0);
                assert_eq!(new_state, MatchState::Finished);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let raw = r#"{"type":"SOMETHING_ELSE","created_at":5}"#;
        assert!(serde_json::from_str::<ServiceUpdate>(raw).is_err());
    }
}
