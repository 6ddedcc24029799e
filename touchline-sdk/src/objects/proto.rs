//! Protobuf envelopes for the streaming gateway.
//!
//! Messages are declared with `prost` derives instead of generated code,
//! so the schema lives here and needs no build step. Field tags are part
//! of the wire contract and must never be reused.

use prost::{Enumeration, Message};

use super::DeliveryStatus;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum PbDeliveryStatus {
    Unspecified = 0,
    Sent = 1,
    Delivered = 2,
    Read = 3,
}

impl From<DeliveryStatus> for PbDeliveryStatus {
    fn from(value: DeliveryStatus) -> Self {
        match value {
            DeliveryStatus::Sent => PbDeliveryStatus::Sent,
            DeliveryStatus::Delivered => PbDeliveryStatus::Delivered,
            DeliveryStatus::Read => PbDeliveryStatus::Read,
        }
    }
}

/// Published on `unread-counters-updates:{user_id}` whenever a user's
/// total unread count changes.
#[derive(Clone, PartialEq, Message)]
pub struct UnreadCountersUpdate {
    #[prost(int64, optional, tag = "1")]
    pub user_id: Option<i64>,
    #[prost(int64, tag = "2")]
    pub unread_count: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct ChatMessage {
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(int64, tag = "2")]
    pub chat_id: i64,
    #[prost(int64, optional, tag = "3")]
    pub sender_id: Option<i64>,
    #[prost(int64, tag = "4")]
    pub sent_at: i64,
    /// JSON-encoded message content.
    #[prost(string, tag = "5")]
    pub content_json: String,
    #[prost(enumeration = "PbDeliveryStatus", tag = "6")]
    pub state: i32,
    #[prost(int64, optional, tag = "7")]
    pub match_id: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeliveryStatusChangedUpdate {
    #[prost(int64, tag = "1")]
    pub chat_id: i64,
    #[prost(int64, tag = "2")]
    pub message_id: i64,
    #[prost(int64, tag = "3")]
    pub user_id: i64,
    #[prost(enumeration = "PbDeliveryStatus", tag = "4")]
    pub status: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct MessageReceivedUpdate {
    #[prost(message, optional, tag = "1")]
    pub message: Option<ChatMessage>,
}

/// Acknowledges a `SendText` command of the same connection.
#[derive(Clone, PartialEq, Message)]
pub struct MessageSentUpdate {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(int64, tag = "2")]
    pub chat_id: i64,
    #[prost(int64, tag = "3")]
    pub message_id: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct UserStatusChangedUpdate {
    #[prost(int64, tag = "1")]
    pub user_id: i64,
    #[prost(bool, tag = "2")]
    pub online: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct UserIsTypingUpdate {
    #[prost(int64, tag = "1")]
    pub chat_id: i64,
    #[prost(int64, tag = "2")]
    pub user_id: i64,
    #[prost(bool, tag = "3")]
    pub is_typing: bool,
}

/// A command-level failure that does not close the connection.
#[derive(Clone, PartialEq, Message)]
pub struct ErrorUpdate {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(uint32, tag = "2")]
    pub code: u32,
    #[prost(string, tag = "3")]
    pub reason: String,
}

/// Server → client frame.
#[derive(Clone, PartialEq, Message)]
pub struct ServerUpdate {
    #[prost(oneof = "server_update::Update", tags = "1, 2, 3, 4, 5, 6, 7")]
    pub update: Option<server_update::Update>,
}

pub mod server_update {
    use prost::Oneof;

    #[derive(Clone, PartialEq, Oneof)]
    pub enum Update {
        #[prost(message, tag = "1")]
        DeliveryStatusChanged(super::DeliveryStatusChangedUpdate),
        #[prost(message, tag = "2")]
        MessageReceived(super::MessageReceivedUpdate),
        #[prost(message, tag = "3")]
        MessageSent(super::MessageSentUpdate),
        #[prost(message, tag = "4")]
        UserStatusChanged(super::UserStatusChangedUpdate),
        #[prost(message, tag = "5")]
        UserIsTyping(super::UserIsTypingUpdate),
        #[prost(message, tag = "6")]
        UnreadCounters(super::UnreadCountersUpdate),
        #[prost(message, tag = "7")]
        Error(super::ErrorUpdate),
    }
}

impl From<server_update::Update> for ServerUpdate {
    fn from(update: server_update::Update) -> Self {
        Self {
            update: Some(update),
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct SendTextCommand {
    #[prost(int64, tag = "1")]
    pub chat_id: i64,
    #[prost(string, tag = "2")]
    pub text: String,
    #[prost(int64, optional, tag = "3")]
    pub reply_to: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct MarkReadCommand {
    #[prost(int64, tag = "1")]
    pub chat_id: i64,
    #[prost(int64, tag = "2")]
    pub message_id: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct SendActivityCommand {
    #[prost(int64, tag = "1")]
    pub chat_id: i64,
    #[prost(bool, tag = "2")]
    pub is_typing: bool,
}

/// Client → server frame.
#[derive(Clone, PartialEq, Message)]
pub struct ClientCommand {
    /// Opaque id echoed back in the matching `MessageSent` / `Error` update.
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(oneof = "client_command::Command", tags = "2, 3, 4")]
    pub command: Option<client_command::Command>,
}

pub mod client_command {
    use prost::Oneof;

    #[derive(Clone, PartialEq, Oneof)]
    pub enum Command {
        #[prost(message, tag = "2")]
        SendText(super::SendTextCommand),
        #[prost(message, tag = "3")]
        MarkRead(super::MarkReadCommand),
        #[prost(message, tag = "4")]
        SendActivity(super::SendActivityCommand),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unread_update_without_user_id_decodes_as_none() {
        let encoded = UnreadCountersUpdate {
            user_id: None,
            unread_count: 3,
        }
        .encode_to_vec();
        let decoded = UnreadCountersUpdate::decode(encoded.as_slice()).unwrap();
        assert_eq!(decoded.user_id, None);
        assert_eq!(decoded.unread_count, 3);
    }

    #[test]
    fn test_server_update_oneof() {
        let update: ServerUpdate = server_update::Update::UnreadCounters(UnreadCountersUpdate {
            user_id: Some(9),
            unread_count: 4,
        })
        .into();
        let decoded = ServerUpdate::decode(update.encode_to_vec().as_slice()).unwrap();
        assert!(matches!(
            decoded.update,
            Some(server_update::Update::UnreadCounters(UnreadCountersUpdate {
                user_id: Some(9),
                unread_count: 4
            }))
        ));
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        assert!(ClientCommand::decode(&[0xff, 0xff, 0xff][..]).is_err());
    }
}
