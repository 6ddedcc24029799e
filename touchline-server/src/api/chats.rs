use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use touchline_sdk::objects::ChatId;
use touchline_sdk::objects::chats::{
    ChatResponse, CreateChatRequest, CreateChatResponse, MessageResponse, MessagesQuery,
    SearchChatsQuery, SendMessageRequest, UnreadCountResponse,
};

use super::ApiResult;
use super::extractors::AuthUser;
use crate::state::AppState;

pub(super) async fn unread_count(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
) -> ApiResult<Json<UnreadCountResponse>> {
    Ok(Json(state.messenger.unread_count(&actor).await?))
}

pub(super) async fn search_chats(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Query(query): Query<SearchChatsQuery>,
) -> ApiResult<Json<Vec<ChatResponse>>> {
    Ok(Json(state.messenger.search_chats(&actor, &query).await?))
}

pub(super) async fn create_chat(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Json(request): Json<CreateChatRequest>,
) -> ApiResult<(StatusCode, Json<CreateChatResponse>)> {
    let created = state.messenger.create_chat(&actor, request.user_id).await?;
    let status = if created.is_new {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(created)))
}

pub(super) async fn get_chat(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(chat_id): Path<ChatId>,
) -> ApiResult<Json<ChatResponse>> {
    Ok(Json(state.messenger.get_chat(&actor, chat_id).await?))
}

pub(super) async fn close_chat(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(chat_id): Path<ChatId>,
) -> ApiResult<StatusCode> {
    state.messenger.close_chat(&actor, chat_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn open_chat(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(chat_id): Path<ChatId>,
) -> ApiResult<StatusCode> {
    state.messenger.open_chat(&actor, chat_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn join_chat(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(chat_id): Path<ChatId>,
) -> ApiResult<StatusCode> {
    state.messenger.join_chat(&actor, chat_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn leave_chat(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(chat_id): Path<ChatId>,
) -> ApiResult<StatusCode> {
    state.messenger.leave_chat(&actor, chat_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn get_messages(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(chat_id): Path<ChatId>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Json<Vec<MessageResponse>>> {
    Ok(Json(
        state
            .messenger
            .get_chat_messages(&actor, chat_id, &query)
            .await?,
    ))
}

pub(super) async fn send_message(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(chat_id): Path<ChatId>,
    Json(request): Json<SendMessageRequest>,
) -> ApiResult<(StatusCode, Json<MessageResponse>)> {
    let message = state
        .messenger
        .send_message(&actor, chat_id, request.text, request.reply_to)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}
