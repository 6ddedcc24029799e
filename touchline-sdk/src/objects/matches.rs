//! Match objects: provider facts, bus payloads and HTTP responses.

use serde::{Deserialize, Serialize};

use super::{ChatId, MatchId, MatchState, UserId};

/// Descriptive fields of a match that may change while it is tracked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchFields {
    pub sport: String,
    pub tournament: String,
    pub home_team: String,
    pub away_team: String,
    /// Unix timestamp (seconds) of the scheduled start.
    pub starts_at: i64,
}

/// A scout assigned to a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchScout {
    pub user_id: UserId,
    pub scout_number: i32,
    pub name: String,
    pub is_main_scout: bool,
}

/// Full picture of a match as published in `MATCH_CREATED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSnapshot {
    pub sportlevel_id: MatchId,
    pub state: MatchState,
    pub fields: MatchFields,
    pub scouts: Vec<MatchScout>,
}

/// `GET /matches/{id}` and list item of `GET /matches`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResponse {
    pub sportlevel_id: MatchId,
    pub state: MatchState,
    pub is_active: bool,
    #[serde(flatten)]
    pub fields: MatchFields,
    pub scouts: Vec<MatchScout>,
    pub unread_count: i64,
}

/// Query parameters of `GET /matches`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchesQuery {
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// Body of `POST /matches/{id}/start_chat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartChatRequest {
    pub scout_user_id: UserId,
}

/// One scout entry of `GET /matches/{id}/chat_options`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoutChatOption {
    pub scout: MatchScout,
    /// Chat the requesting bookmaker already has with this scout.
    pub existing_chat_id: Option<ChatId>,
    /// Whether a new chat with this scout may be started.
    pub can_start_chat: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatOptionsResponse {
    pub match_id: MatchId,
    pub options: Vec<ScoutChatOption>,
}
