use futures_util::{SinkExt, StreamExt};
use prost::Message as _;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use super::ClientError;
use crate::objects::proto::{ClientCommand, ServerUpdate};
use crate::objects::ws::WsCloseCode;

/// A connected gateway session.
///
/// ```no_run
/// # async fn demo() -> Result<(), touchline_sdk::client::ClientError> {
/// use touchline_sdk::client::StreamClient;
///
/// let base = url::Url::parse("ws://127.0.0.1:8080").unwrap();
/// let mut client = StreamClient::connect(&base, "service-token").await?;
/// while let Some(update) = client.next_update().await? {
///     println!("{update:?}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct StreamClient {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl StreamClient {
    /// Connect to `{base_url}/ws` authenticating with `token`.
    pub async fn connect(base_url: &Url, token: &str) -> Result<Self, ClientError> {
        let mut url = base_url.join("/ws")?;
        url.query_pairs_mut().append_pair("token", token);
        let (socket, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        Ok(Self { socket })
    }

    /// Wait for the next server update.
    ///
    /// Returns `Ok(None)` after a normal close, and
    /// [`ClientError::Closed`] for any other close code.
    pub async fn next_update(&mut self) -> Result<Option<ServerUpdate>, ClientError> {
        while let Some(frame) = self.socket.next().await {
            match frame? {
                Message::Binary(data) => return Ok(Some(ServerUpdate::decode(data.as_slice())?)),
                Message::Close(Some(close)) => {
                    let code = u16::from(close.code);
                    if code == WsCloseCode::NORMAL {
                        return Ok(None);
                    }
                    return Err(ClientError::Closed {
                        code,
                        reason: close.reason.into_owned(),
                    });
                }
                Message::Close(None) => return Ok(None),
                _ => continue,
            }
        }
        Ok(None)
    }

    /// Send a command frame.
    pub async fn send_command(&mut self, command: &ClientCommand) -> Result<(), ClientError> {
        self.socket
            .send(Message::Binary(command.encode_to_vec()))
            .await?;
        Ok(())
    }

    /// Close the session with a normal close frame.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.socket.close(None).await?;
        Ok(())
    }
}
