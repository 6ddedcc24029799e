use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use touchline_sdk::objects::MatchId;
use touchline_sdk::objects::chats::CreateChatResponse;
use touchline_sdk::objects::matches::{
    ChatOptionsResponse, MatchResponse, MatchesQuery, StartChatRequest,
};

use super::ApiResult;
use super::extractors::AuthUser;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub(super) struct GetMatchQuery {
    /// Fetch and store the match from the provider when the database does
    /// not know it. Defaults by role.
    #[serde(default)]
    try_index: Option<bool>,
}

pub(super) async fn get_match(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(match_id): Path<MatchId>,
    Query(query): Query<GetMatchQuery>,
) -> ApiResult<Json<MatchResponse>> {
    Ok(Json(
        state
            .messenger
            .get_match(&actor, match_id, query.try_index)
            .await?,
    ))
}

pub(super) async fn get_matches(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Query(query): Query<MatchesQuery>,
) -> ApiResult<Json<Vec<MatchResponse>>> {
    Ok(Json(state.messenger.get_matches(&actor, &query).await?))
}

pub(super) async fn start_chat(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(match_id): Path<MatchId>,
    Json(request): Json<StartChatRequest>,
) -> ApiResult<(StatusCode, Json<CreateChatResponse>)> {
    let created = state
        .messenger
        .start_chat(&actor, match_id, request.scout_user_id)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub(super) async fn get_chat_options(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(match_id): Path<MatchId>,
) -> ApiResult<Json<ChatOptionsResponse>> {
    Ok(Json(
        state.messenger.get_chat_options(&actor, match_id).await?,
    ))
}
