//! HTTP API.
//!
//! Every endpoint except `/health` requires a service token (see
//! [`extractors`]).
//!
//! # Endpoints
//!
//! - `GET  /chats/unread_count`, `GET|POST /chats`, `GET /chats/{id}`
//! - `POST /chats/{id}/close|open|join|leave`
//! - `GET|POST /chats/{id}/messages`
//! - `GET  /matches`, `GET /matches/{id}`, `POST /matches/{id}/start_chat`,
//!   `GET /matches/{id}/chat_options`
//! - `GET|POST /tickets`, `GET /tickets/counters`, `GET /tickets/{id}`,
//!   `POST /tickets/{id}/take|close|confirm|reopen`
//! - `GET  /ws` – streaming gateway

use axum::{
    Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use touchline_core::controllers::ControllerError;

use crate::state::AppState;

mod chats;
pub mod extractors;
mod matches;
mod tickets;
mod ws;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/chats/unread_count", get(chats::unread_count))
        .route("/chats", get(chats::search_chats).post(chats::create_chat))
        .route("/chats/{chat_id}", get(chats::get_chat))
        .route("/chats/{chat_id}/close", post(chats::close_chat))
        .route("/chats/{chat_id}/open", post(chats::open_chat))
        .route("/chats/{chat_id}/join", post(chats::join_chat))
        .route("/chats/{chat_id}/leave", post(chats::leave_chat))
        .route(
            "/chats/{chat_id}/messages",
            get(chats::get_messages).post(chats::send_message),
        )
        .route("/matches", get(matches::get_matches))
        .route("/matches/{match_id}", get(matches::get_match))
        .route("/matches/{match_id}/start_chat", post(matches::start_chat))
        .route(
            "/matches/{match_id}/chat_options",
            get(matches::get_chat_options),
        )
        .route(
            "/tickets",
            get(tickets::search_tickets).post(tickets::create_ticket),
        )
        .route("/tickets/counters", get(tickets::get_ticket_counters))
        .route("/tickets/{ticket_id}", get(tickets::get_ticket))
        .route("/tickets/{ticket_id}/take", post(tickets::take_into_work))
        .route("/tickets/{ticket_id}/close", post(tickets::close_ticket))
        .route("/tickets/{ticket_id}/confirm", post(tickets::confirm_ticket))
        .route("/tickets/{ticket_id}/reopen", post(tickets::reopen_ticket))
        .route("/ws", get(ws::gateway))
}

/// HTTP face of a [`ControllerError`].
#[derive(Debug)]
pub struct ApiError(pub ControllerError);

impl From<ControllerError> for ApiError {
    fn from(err: ControllerError) -> Self {
        Self(err)
    }
}

pub fn status_of(err: &ControllerError) -> StatusCode {
    match err {
        ControllerError::Forbidden(_) => StatusCode::FORBIDDEN,
        ControllerError::NotFound(_) => StatusCode::NOT_FOUND,
        ControllerError::Conflict(_) => StatusCode::CONFLICT,
        ControllerError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ControllerError::Provider(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_of(&self.0);
        if self.0.is_internal() {
            tracing::error!(error = %self.0, "API request failed");
            let message = if status == StatusCode::BAD_GATEWAY {
                "upstream error"
            } else {
                "internal server error"
            };
            return (status, message).into_response();
        }
        (status, self.0.to_string()).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
