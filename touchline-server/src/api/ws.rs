//! `GET /ws` – streaming gateway.
//!
//! The socket is accepted before the token is checked so that a bad token
//! can be reported with a close code instead of an HTTP status. After
//! that the connection is registered with the [`Gateway`] and one loop
//! multiplexes three sources until one of them ends it:
//!
//! - the shutdown signal (close 1001),
//! - the connection's outbound queue (updates, or a close request),
//! - client frames, each a protobuf `ClientCommand`.
//!
//! [`Gateway`]: touchline_core::streaming::Gateway

use axum::{
    extract::{
        Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use prost::Message as _;
use serde::Deserialize;
use touchline_core::controllers::{Actor, ControllerError, Messenger};
use touchline_core::streaming::Outbound;
use touchline_sdk::objects::proto::{
    ClientCommand, ErrorUpdate, MessageSentUpdate, ServerUpdate, client_command::Command,
    server_update::Update,
};
use touchline_sdk::objects::ws::{SERVER_SHUTDOWN_REASON, WsCloseCode};

use super::extractors::bearer_token;
use super::status_of;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub(super) struct GatewayQuery {
    #[serde(default)]
    token: Option<String>,
}

pub(super) async fn gateway(
    State(state): State<AppState>,
    Query(query): Query<GatewayQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = query
        .token
        .or_else(|| bearer_token(&headers).map(str::to_owned));
    ws.on_upgrade(move |socket| handle_socket(socket, state, token))
}

type Sender = SplitSink<WebSocket, Message>;

async fn handle_socket(mut socket: WebSocket, state: AppState, token: Option<String>) {
    let actor = match token.as_deref().map(|t| state.tokens.verify(t)) {
        Some(Ok(actor)) => actor,
        Some(Err(e)) => {
            tracing::debug!(error = %e, "WS: rejecting token");
            let _ = socket
                .send(close_frame(WsCloseCode::PROTOCOL_ERROR, "invalid token"))
                .await;
            return;
        }
        None => {
            let _ = socket
                .send(close_frame(WsCloseCode::PROTOCOL_ERROR, "invalid token"))
                .await;
            return;
        }
    };

    let (connection_id, mut outbound) = match state.gateway.connect(actor.user_id).await {
        Ok(registered) => registered,
        Err(e) => {
            tracing::error!(error = %e, user_id = actor.user_id, "WS: failed to register connection");
            let _ = socket
                .send(close_frame(WsCloseCode::INTERNAL_ERROR, "pub/sub unavailable"))
                .await;
            return;
        }
    };
    let cid = connection_id.to_string();
    let (mut sender, mut receiver) = socket.split();
    let mut shutdown_rx = state.shutdown_rx.clone();

    let close = loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break Some((WsCloseCode::GOING_AWAY, SERVER_SHUTDOWN_REASON));
                }
            }

            item = outbound.recv() => match item {
                Some(Outbound::Update(update)) => {
                    if send_update(&mut sender, &update).await.is_err() {
                        break None;
                    }
                }
                Some(Outbound::Close { code, reason }) => break Some((code, reason)),
                None => break Some((WsCloseCode::INTERNAL_ERROR, "connection dropped")),
            },

            frame = receiver.next() => match frame {
                Some(Ok(Message::Binary(bytes))) => {
                    state.gateway.touch(actor.user_id).await;
                    let reply = handle_command(&state.messenger, &actor, &cid, &bytes).await;
                    if let Some(reply) = reply
                        && send_update(&mut sender, &reply).await.is_err()
                    {
                        break None;
                    }
                }
                Some(Ok(Message::Text(_))) => {
                    let reply = error_update(String::new(), 400, "binary frames only");
                    if send_update(&mut sender, &reply).await.is_err() {
                        break None;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break None,
                Some(Ok(_)) => {}
            },
        }
    };

    state.gateway.disconnect(connection_id, actor.user_id).await;
    if let Some((code, reason)) = close {
        let _ = sender.send(close_frame(code, reason)).await;
    }
}

fn close_frame(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

async fn send_update(sender: &mut Sender, update: &ServerUpdate) -> Result<(), axum::Error> {
    sender
        .send(Message::Binary(update.encode_to_vec().into()))
        .await
}

fn error_update(request_id: String, code: u32, reason: impl Into<String>) -> ServerUpdate {
    Update::Error(ErrorUpdate {
        request_id,
        code,
        reason: reason.into(),
    })
    .into()
}

/// Error update for a failed command. Internal details stay in the log.
fn controller_error_update(request_id: String, err: &ControllerError) -> ServerUpdate {
    let code = u32::from(status_of(err).as_u16());
    if err.is_internal() {
        tracing::error!(error = %err, "WS: command failed");
        return error_update(request_id, code, "internal error");
    }
    error_update(request_id, code, err.to_string())
}

/// Decode a client frame into its request id and command.
fn decode_command(bytes: &[u8]) -> Result<(String, Command), ServerUpdate> {
    let command = ClientCommand::decode(bytes)
        .map_err(|_| error_update(String::new(), 400, "malformed command"))?;
    match command.command {
        Some(inner) => Ok((command.request_id, inner)),
        None => Err(error_update(command.request_id, 400, "empty command")),
    }
}

/// Run one client command. Returns the update to send back, if any.
async fn handle_command(
    messenger: &Messenger,
    actor: &Actor,
    cid: &str,
    bytes: &[u8],
) -> Option<ServerUpdate> {
    let (request_id, command) = match decode_command(bytes) {
        Ok(decoded) => decoded,
        Err(reply) => return Some(reply),
    };
    let result = match command {
        Command::SendText(cmd) => {
            return Some(
                match messenger
                    .send_message_from(actor, cmd.chat_id, cmd.text, cmd.reply_to, Some(cid))
                    .await
                {
                    Ok(message) => Update::MessageSent(MessageSentUpdate {
                        request_id,
                        chat_id: message.chat_id,
                        message_id: message.id,
                    })
                    .into(),
                    Err(e) => controller_error_update(request_id, &e),
                },
            );
        }
        Command::MarkRead(cmd) => messenger
            .mark_read(actor, cmd.chat_id, cmd.message_id)
            .await
            .map(|_| ()),
        Command::SendActivity(cmd) => {
            messenger
                .send_activity(actor, cmd.chat_id, cmd.is_typing)
                .await
        }
    };
    result
        .err()
        .map(|e| controller_error_update(request_id, &e))
}
