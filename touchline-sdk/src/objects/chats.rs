//! Chat and message objects of the HTTP API.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{
    ChatId, ChatType, DeliveryStatus, MatchId, MessageContent, MessageId, PresenceStatus, Role,
    UserId,
};

/// Body of `POST /chats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChatRequest {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChatResponse {
    pub chat_id: ChatId,
    pub is_new: bool,
}

/// A chat member annotated with live presence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMemberResponse {
    pub user_id: UserId,
    pub role: Role,
    pub is_primary_member: bool,
    pub can_write: bool,
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: ChatId,
    #[serde(rename = "type")]
    pub chat_type: ChatType,
    pub match_id: Option<MatchId>,
    pub is_closed: bool,
    pub members: Vec<ChatMemberResponse>,
    pub unread_count: i64,
    pub last_message_id: Option<MessageId>,
}

/// Query parameters of `GET /chats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchChatsQuery {
    #[serde(default, rename = "type")]
    pub chat_type: Option<ChatType>,
    #[serde(default)]
    pub match_id: Option<MatchId>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

/// Query parameters of `GET /chats/{id}/messages`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagesQuery {
    #[serde(default)]
    pub from_message_id: Option<MessageId>,
    #[serde(default)]
    pub backwards: bool,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

/// Body of `POST /chats/{id}/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: Option<UserId>,
    pub content: MessageContent,
    pub reply_to: Option<MessageId>,
    pub delivery_status: DeliveryStatus,
    /// Unix timestamp (seconds).
    pub created_at: i64,
}

/// `GET /chats/unread_count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnreadCountResponse {
    pub total: i64,
    pub by_chat_type: HashMap<ChatType, i64>,
}
