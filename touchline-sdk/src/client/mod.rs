//! Streaming client for the touchline gateway.
//!
//! Gated behind the `client` cargo feature so crates that only need the
//! shared types do not pull in a WebSocket stack.

mod stream;

pub use stream::StreamClient;

/// Errors produced by the SDK clients.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport-level failure (DNS, TLS, handshake, connection reset, …).
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A frame could not be decoded as a protobuf update.
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The base URL could not be joined with the endpoint path.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    /// The server closed the connection.
    #[error("closed by server: {code} {reason}")]
    Closed { code: u16, reason: String },
}
