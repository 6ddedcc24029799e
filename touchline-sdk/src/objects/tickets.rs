//! Ticket objects of the HTTP API.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{ChatId, TicketCloseReason, TicketId, TicketStatus, UserId};

/// Body of `POST /tickets`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateTicketRequest {
    #[serde(default)]
    pub created_from_chat_id: Option<ChatId>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Body of `POST /tickets/{id}/close`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseTicketRequest {
    pub reason: TicketCloseReason,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketResponse {
    pub id: TicketId,
    pub status: TicketStatus,
    pub chat_id: ChatId,
    pub created_from_chat_id: Option<ChatId>,
    pub created_by_user_id: UserId,
    pub assigned_to_user_id: Option<UserId>,
    pub comment: Option<String>,
    pub close_reason: Option<TicketCloseReason>,
    /// Unix timestamps (seconds).
    pub created_at: i64,
    pub updated_at: Option<i64>,
}

/// Query parameters of `GET /tickets`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchTicketsQuery {
    #[serde(default)]
    pub status: Option<TicketStatus>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// `GET /tickets/counters`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketCountersResponse {
    pub by_ticket_status: HashMap<TicketStatus, i64>,
}
