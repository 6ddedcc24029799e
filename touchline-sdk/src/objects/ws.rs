//! WebSocket protocol constants for the streaming gateway.
//!
//! # Protocol
//!
//! 1. The client connects to `GET /ws` with a service token in the
//!    `token` query parameter or an `Authorization: Bearer` header.
//! 2. If the token is missing, invalid, expired or issued for an audience
//!    the gateway does not serve, the server closes with
//!    [`WsCloseCode::PROTOCOL_ERROR`].
//! 3. Otherwise every frame in both directions is a binary protobuf
//!    message: [`ServerUpdate`](super::proto::ServerUpdate) from the server,
//!    [`ClientCommand`](super::proto::ClientCommand) from the client.
//! 4. On shutdown the server closes with [`WsCloseCode::GOING_AWAY`] and
//!    reason `"server shutdown"`; clients should reconnect.

/// Well-known WebSocket close codes used by the streaming gateway.
///
/// See [RFC 6455 §7.4.1](https://www.rfc-editor.org/rfc/rfc6455#section-7.4.1).
pub struct WsCloseCode;

impl WsCloseCode {
    /// Normal closure initiated by either side.
    pub const NORMAL: u16 = 1000;

    /// The server is shutting down. Retryable.
    pub const GOING_AWAY: u16 = 1001;

    /// Authentication failed or the client violated the protocol.
    pub const PROTOCOL_ERROR: u16 = 1002;

    /// The pub/sub backend or another dependency failed.
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Close reason sent together with [`WsCloseCode::GOING_AWAY`].
pub const SERVER_SHUTDOWN_REASON: &str = "server shutdown";
