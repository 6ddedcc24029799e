use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use touchline_sdk::objects::TicketId;
use touchline_sdk::objects::tickets::{
    CloseTicketRequest, CreateTicketRequest, SearchTicketsQuery, TicketCountersResponse,
    TicketResponse,
};

use super::ApiResult;
use super::extractors::AuthUser;
use crate::state::AppState;

pub(super) async fn create_ticket(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Json(request): Json<CreateTicketRequest>,
) -> ApiResult<(StatusCode, Json<TicketResponse>)> {
    let ticket = state.messenger.create_ticket(&actor, request).await?;
    Ok((StatusCode::CREATED, Json(ticket)))
}

pub(super) async fn search_tickets(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Query(query): Query<SearchTicketsQuery>,
) -> ApiResult<Json<Vec<TicketResponse>>> {
    Ok(Json(state.messenger.search_tickets(&actor, &query).await?))
}

pub(super) async fn get_ticket_counters(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
) -> ApiResult<Json<TicketCountersResponse>> {
    Ok(Json(state.messenger.get_ticket_counters(&actor).await?))
}

pub(super) async fn get_ticket(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(ticket_id): Path<TicketId>,
) -> ApiResult<Json<TicketResponse>> {
    Ok(Json(state.messenger.get_ticket(&actor, ticket_id).await?))
}

pub(super) async fn take_into_work(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(ticket_id): Path<TicketId>,
) -> ApiResult<StatusCode> {
    state.messenger.take_into_work(&actor, ticket_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn close_ticket(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(ticket_id): Path<TicketId>,
    Json(request): Json<CloseTicketRequest>,
) -> ApiResult<StatusCode> {
    state
        .messenger
        .close_ticket(&actor, ticket_id, request.reason, request.comment)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn confirm_ticket(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(ticket_id): Path<TicketId>,
) -> ApiResult<StatusCode> {
    state.messenger.confirm_ticket(&actor, ticket_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn reopen_ticket(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(ticket_id): Path<TicketId>,
) -> ApiResult<StatusCode> {
    state.messenger.reopen_ticket(&actor, ticket_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
