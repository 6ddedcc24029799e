//! Wire objects shared between the server, its background jobs and clients.

pub mod chats;
pub mod matches;
pub mod proto;
pub mod tickets;
pub mod updates;
pub mod ws;

use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type ChatId = i64;
pub type MessageId = i64;
/// Match identifier assigned by the sports data provider.
pub type MatchId = i64;
pub type TicketId = i64;

/// Role of an authenticated user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Bookmaker,
    Scout,
    Supervisor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatType {
    Personal,
    Match,
    Ticket,
}

impl ChatType {
    pub const ALL: [ChatType; 3] = [ChatType::Personal, ChatType::Match, ChatType::Ticket];
}

/// Projected state of a match.
///
/// `Archived` is never reported by the provider; it is a per-viewer
/// projection for scouts whose chat membership has been archived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchState {
    NotStarted,
    Live,
    Interrupted,
    Finished,
    Cancelled,
    Archived,
}

/// Ticket lifecycle status.
///
/// A ticket that has been taken by a supervisor is `InProgress` with an
/// assignee; there is no separate assigned status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    New,
    InProgress,
    Solved,
    Confirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketCloseReason {
    Resolved,
    Duplicate,
    Invalid,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Body of a stored message.
///
/// User messages carry text; everything else is a system notification
/// appended by the server after a state change has been committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: String },
    ChatCreated { created_by: Option<UserId> },
    ChatClosed { reason: ChatCloseReason },
    ChatOpened { reason: ChatOpenReason },
    UserJoined { user_id: UserId },
    UserLeft { user_id: UserId },
    TicketCreated { ticket_id: TicketId },
    RelatedTicketCreated { ticket_id: TicketId, ticket_chat_id: ChatId },
    TicketClosed {
        ticket_id: TicketId,
        reason: TicketCloseReason,
        comment: Option<String>,
    },
}

impl MessageContent {
    /// Whether the message was written by a user rather than the server.
    pub fn is_user_message(&self) -> bool {
        matches!(self, MessageContent::Text { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatCloseReason {
    InitiatedByUser,
    Inactivity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatOpenReason {
    InitiatedByUser,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_content_tagging() {
        let content = MessageContent::UserJoined { user_id: 7 };
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["kind"], "user_joined");
        assert_eq!(json["user_id"], 7);
        assert!(!content.is_user_message());
    }

    #[test]
    fn test_enum_wire_names() {
        assert_eq!(
            serde_json::to_string(&TicketStatus::InProgress).unwrap(),
            "\"IN_PROGRESS\""
        );
        assert_eq!(
            serde_json::to_string(&MatchState::NotStarted).unwrap(),
            "\"NOT_STARTED\""
        );
    }
}
