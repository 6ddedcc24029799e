//! Message history, sending, read marks and typing notifications.

use kanau::processor::Processor;
use touchline_sdk::objects::chats::{MessageResponse, MessagesQuery};
use touchline_sdk::objects::updates::{ServiceUpdate, UpdateKind};
use touchline_sdk::objects::{ChatId, DeliveryStatus, MessageContent, MessageId, UserId};

use super::{Actor, ControllerError, ControllerResult, Messenger};
use crate::entities::chats::{Chat, GetChatById};
use crate::entities::members::{ChatMember, GetChatMembers};
use crate::entities::messages::{GetChatMessages, InsertMessage, Message};
use crate::entities::unix_seconds;

const MAX_PAGE: i64 = 200;

/// Range of message ids a reader may see. Both bounds are inclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadWindow {
    pub min_id: Option<MessageId>,
    pub max_id: Option<MessageId>,
}

impl ReadWindow {
    /// Window of a member; a reader without membership (a supervisor) sees
    /// everything.
    pub fn of(membership: Option<&ChatMember>) -> Self {
        match membership {
            Some(m) => ReadWindow {
                min_id: m.first_available_message_id,
                max_id: m.last_available_message_id,
            },
            None => ReadWindow::default(),
        }
    }

    /// Page query with the cursor moved up to the watermark.
    pub fn page(&self, chat_id: ChatId, query: &MessagesQuery) -> GetChatMessages {
        let from_message_id = match (query.from_message_id, self.min_id) {
            (Some(from), Some(min)) if from < min => Some(min),
            (from, _) => from,
        };
        GetChatMessages {
            chat_id,
            from_message_id,
            backwards: query.backwards,
            limit: query.limit.clamp(1, MAX_PAGE),
            min_id: self.min_id,
            max_id: self.max_id,
        }
    }
}

pub fn check_read_access(actor: &Actor, membership: Option<&ChatMember>) -> ControllerResult<()> {
    match membership {
        Some(m) if m.can_read => Ok(()),
        Some(_) if actor.is_supervisor() => Ok(()),
        Some(_) => Err(ControllerError::Forbidden("no read access to the chat")),
        None if actor.is_supervisor() => Ok(()),
        None => Err(ControllerError::Forbidden("not a member of the chat")),
    }
}

pub fn check_write_access(chat: &Chat, membership: Option<&ChatMember>) -> ControllerResult<()> {
    if chat.is_closed {
        return Err(ControllerError::Forbidden("chat is closed"));
    }
    let Some(membership) = membership else {
        return Err(ControllerError::Forbidden("not a member of the chat"));
    };
    if !membership.can_write || membership.is_archive_member {
        return Err(ControllerError::Forbidden("no write access to the chat"));
    }
    Ok(())
}

/// Delivery status of `message` as seen by `reader`.
///
/// For the reader's own messages the status reflects the furthest any other
/// member got; for everything else, the reader's own watermarks.
pub fn delivery_status(message: &Message, reader: UserId, members: &[ChatMember]) -> DeliveryStatus {
    let reached = |m: &ChatMember| {
        if m.last_read_message_id.is_some_and(|id| id >= message.id) {
            DeliveryStatus::Read
        } else if m.last_received_message_id.is_some_and(|id| id >= message.id) {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::Sent
        }
    };
    let rank = |s: DeliveryStatus| match s {
        DeliveryStatus::Sent => 0,
        DeliveryStatus::Delivered => 1,
        DeliveryStatus::Read => 2,
    };
    let own = message.sender_id == Some(reader);
    members
        .iter()
        .filter(|m| m.chat_id == message.chat_id && (m.user_id == reader) != own)
        .map(reached)
        .max_by_key(|s| rank(*s))
        .unwrap_or(DeliveryStatus::Sent)
}

pub fn message_response(message: Message, status: DeliveryStatus) -> MessageResponse {
    MessageResponse {
        id: message.id,
        chat_id: message.chat_id,
        sender_id: message.sender_id,
        content: message.content.0,
        reply_to: message.reply_to,
        delivery_status: status,
        created_at: unix_seconds(message.created_at),
    }
}

impl Messenger {
    #[tracing::instrument(skip_all, err, fields(user_id = actor.user_id, chat_id = chat_id))]
    pub async fn get_chat_messages(
        &self,
        actor: &Actor,
        chat_id: ChatId,
        query: &MessagesQuery,
    ) -> ControllerResult<Vec<MessageResponse>> {
        self.db
            .process(GetChatById { chat_id })
            .await?
            .ok_or(ControllerError::NotFound("chat"))?;
        let members = self
            .db
            .process(GetChatMembers {
                chat_ids: vec![chat_id],
            })
            .await?;
        let membership = members.iter().find(|m| m.user_id == actor.user_id);
        check_read_access(actor, membership)?;

        let page = ReadWindow::of(membership).page(chat_id, query);
        let messages = self.db.process(page).await?;
        Ok(messages
            .into_iter()
            .map(|m| {
                let status = delivery_status(&m, actor.user_id, &members);
                message_response(m, status)
            })
            .collect())
    }

    pub async fn send_message(
        &self,
        actor: &Actor,
        chat_id: ChatId,
        text: String,
        reply_to: Option<MessageId>,
    ) -> ControllerResult<MessageResponse> {
        self.send_message_from(actor, chat_id, text, reply_to, None)
            .await
    }

    /// [`send_message`](Self::send_message) on behalf of a gateway
    /// connection; fan-out skips the `connection` that sent it.
    #[tracing::instrument(skip_all, err, fields(user_id = actor.user_id, chat_id = chat_id))]
    pub async fn send_message_from(
        &self,
        actor: &Actor,
        chat_id: ChatId,
        text: String,
        reply_to: Option<MessageId>,
        connection: Option<&str>,
    ) -> ControllerResult<MessageResponse> {
        if text.trim().is_empty() {
            return Err(ControllerError::Unprocessable("message is empty"));
        }
        let chat = self
            .db
            .process(GetChatById { chat_id })
            .await?
            .ok_or(ControllerError::NotFound("chat"))?;
        let membership = self.membership(chat_id, actor.user_id).await?;
        check_write_access(&chat, membership.as_ref())?;
        if let Some(reply_to) = reply_to
            && !Message::exists_in_chat(&self.db.pool, chat_id, reply_to).await?
        {
            return Err(ControllerError::Unprocessable("reply target is not in the chat"));
        }

        let message = self
            .db
            .process(InsertMessage {
                chat_id,
                sender_id: Some(actor.user_id),
                content: MessageContent::Text { text },
                reply_to,
            })
            .await?;
        self.announce_message_from(&message, Some(actor.user_id), false, connection)
            .await;
        Ok(message_response(message, DeliveryStatus::Sent))
    }

    /// Move the read watermark up to `message_id`. Returns `false` when the
    /// watermark already was at or past it.
    #[tracing::instrument(skip_all, err, fields(user_id = actor.user_id, chat_id = chat_id, message_id = message_id))]
    pub async fn mark_read(
        &self,
        actor: &Actor,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> ControllerResult<bool> {
        let membership = self
            .membership(chat_id, actor.user_id)
            .await?
            .ok_or(ControllerError::Forbidden("not a member of the chat"))?;
        if membership
            .last_available_message_id
            .is_some_and(|max| message_id > max)
        {
            return Err(ControllerError::Unprocessable("message is outside the read window"));
        }
        if !Message::exists_in_chat(&self.db.pool, chat_id, message_id).await? {
            return Err(ControllerError::NotFound("message"));
        }
        if !ChatMember::advance_last_read(&self.db.pool, chat_id, actor.user_id, message_id).await? {
            return Ok(false);
        }

        self.counters.reset_after_read(actor.user_id).await?;
        self.announce(ServiceUpdate::now(UpdateKind::DeliveryStatusChanged {
            message_id,
            chat_id,
            user_id: actor.user_id,
            status: DeliveryStatus::Read,
        }))
        .await;
        Ok(true)
    }

    #[tracing::instrument(skip_all, err, fields(user_id = actor.user_id, chat_id = chat_id))]
    pub async fn send_activity(
        &self,
        actor: &Actor,
        chat_id: ChatId,
        is_typing: bool,
    ) -> ControllerResult<()> {
        if self.membership(chat_id, actor.user_id).await?.is_none() {
            return Err(ControllerError::Forbidden("not a member of the chat"));
        }
        self.announce(ServiceUpdate::now(UpdateKind::UserIsTyping {
            chat_id,
            user_id: actor.user_id,
            is_typing,
        }))
        .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{ChatType, UserRole, utc_now};
    use sqlx::types::Json;
    use touchline_sdk::objects::Role;

    fn member(user_id: UserId) -> ChatMember {
        ChatMember {
            chat_id: 1,
            user_id,
            role: UserRole::Bookmaker,
            can_read: true,
            can_write: true,
            is_primary_member: true,
            is_archive_member: false,
            first_available_message_id: None,
            last_available_message_id: None,
            last_read_message_id: None,
            last_received_message_id: None,
        }
    }

    fn message(id: MessageId, sender_id: Option<UserId>) -> Message {
        Message {
            id,
            chat_id: 1,
            sender_id,
            content: Json(MessageContent::Text { text: "hi".into() }),
            reply_to: None,
            created_at: utc_now(),
        }
    }

    fn chat(is_closed: bool) -> Chat {
        Chat {
            id: 1,
            chat_type: ChatType::Match,
            match_id: Some(100),
            is_closed,
            created_at: utc_now(),
        }
    }

    #[test]
    fn test_cursor_is_clamped_to_watermark() {
        let mut late = member(11);
        late.first_available_message_id = Some(40);
        let window = ReadWindow::of(Some(&late));
        let query = MessagesQuery {
            from_message_id: Some(10),
            backwards: false,
            limit: 1000,
        };

        let page = window.page(1, &query);

        assert_eq!(page.from_message_id, Some(40));
        assert_eq!(page.min_id, Some(40));
        assert_eq!(page.limit, MAX_PAGE);
    }

    #[test]
    fn test_archive_member_window_is_capped() {
        let mut archived = member(20);
        archived.is_archive_member = true;
        archived.last_available_message_id = Some(77);
        let page = ReadWindow::of(Some(&archived)).page(1, &MessagesQuery::default());
        assert_eq!(page.max_id, Some(77));
        assert_eq!(page.min_id, None);
    }

    #[test]
    fn test_supervisor_reads_without_membership() {
        let supervisor = Actor::new(1, Role::Supervisor);
        let bookmaker = Actor::new(2, Role::Bookmaker);
        assert!(check_read_access(&supervisor, None).is_ok());
        assert!(matches!(
            check_read_access(&bookmaker, None),
            Err(ControllerError::Forbidden(_))
        ));

        let mut muted = member(2);
        muted.can_read = false;
        assert!(check_read_access(&bookmaker, Some(&muted)).is_err());
        assert!(check_read_access(&bookmaker, Some(&member(2))).is_ok());
    }

    #[test]
    fn test_write_access() {
        assert!(check_write_access(&chat(false), Some(&member(2))).is_ok());
        assert!(check_write_access(&chat(true), Some(&member(2))).is_err());
        assert!(check_write_access(&chat(false), None).is_err());

        let mut archived = member(2);
        archived.is_archive_member = true;
        assert!(check_write_access(&chat(false), Some(&archived)).is_err());
    }

    #[test]
    fn test_status_of_incoming_message_follows_reader() {
        let mut reader = member(10);
        reader.last_received_message_id = Some(5);
        reader.last_read_message_id = Some(3);
        let members = [reader, member(20)];

        assert_eq!(delivery_status(&message(3, Some(20)), 10, &members), DeliveryStatus::Read);
        assert_eq!(
            delivery_status(&message(5, Some(20)), 10, &members),
            DeliveryStatus::Delivered
        );
        assert_eq!(delivery_status(&message(6, Some(20)), 10, &members), DeliveryStatus::Sent);
    }

    #[test]
    fn test_status_of_own_message_follows_furthest_peer() {
        let mut peer = member(20);
        peer.last_received_message_id = Some(8);
        let mut other = member(30);
        other.last_read_message_id = Some(8);
        let members = [member(10), peer, other];

        assert_eq!(delivery_status(&message(8, Some(10)), 10, &members), DeliveryStatus::Read);
        assert_eq!(delivery_status(&message(9, Some(10)), 10, &members), DeliveryStatus::Sent);
    }
}
