//! Chat lifecycle and membership.

use kanau::processor::Processor;
use std::collections::HashMap;
use touchline_sdk::objects::chats::{
    ChatMemberResponse, ChatResponse, CreateChatResponse, SearchChatsQuery, UnreadCountResponse,
};
use touchline_sdk::objects::updates::{ServiceUpdate, UpdateKind};
use touchline_sdk::objects::{
    ChatCloseReason, ChatId, ChatOpenReason, ChatType as SdkChatType, MessageContent, MessageId,
    PresenceStatus, Role, UserId,
};
use tracing::info;

use super::{Actor, ControllerError, ControllerResult, Messenger};
use crate::entities::chats::{Chat, GetChatById, NewChat, SearchChats, personal_pair_key};
use crate::entities::members::{ChatMember, GetChatMember, GetChatMembers, NewChatMember};
use crate::entities::messages::{GetLastMessageIds, Message};
use crate::entities::{ChatType, UserRole};

/// Guard for closing (`close = true`) or reopening a chat.
pub fn check_toggle(
    chat: &Chat,
    close: bool,
    actor: &Actor,
    membership: Option<&ChatMember>,
) -> ControllerResult<()> {
    if chat.is_closed == close {
        return Err(ControllerError::Conflict(if close {
            "chat is already closed"
        } else {
            "chat is not closed"
        }));
    }
    if chat.chat_type != ChatType::Personal {
        return Err(ControllerError::Forbidden("only personal chats can be closed"));
    }
    if membership.is_none() && !actor.is_supervisor() {
        return Err(ControllerError::Forbidden("not a member of the chat"));
    }
    Ok(())
}

pub fn check_join(chat: &Chat, actor: &Actor, is_member: bool) -> ControllerResult<()> {
    if chat.is_closed {
        return Err(ControllerError::Forbidden("chat is closed"));
    }
    if is_member {
        return Err(ControllerError::Conflict("already a member of the chat"));
    }
    match chat.chat_type {
        ChatType::Match if actor.role == Role::Bookmaker => Ok(()),
        ChatType::Match => Err(ControllerError::Forbidden("only bookmakers may join")),
        ChatType::Personal | ChatType::Ticket => {
            Err(ControllerError::Forbidden("chat is not joinable"))
        }
    }
}

pub fn check_leave(chat: &Chat, membership: Option<&ChatMember>) -> ControllerResult<()> {
    if chat.is_closed {
        return Err(ControllerError::Forbidden("chat is closed"));
    }
    let Some(membership) = membership else {
        return Err(ControllerError::Conflict("not a member of the chat"));
    };
    if chat.chat_type != ChatType::Personal && membership.is_primary_member {
        return Err(ControllerError::Forbidden("primary members cannot leave"));
    }
    Ok(())
}

fn member_response(
    member: &ChatMember,
    statuses: &HashMap<UserId, PresenceStatus>,
) -> ChatMemberResponse {
    ChatMemberResponse {
        user_id: member.user_id,
        role: member.role.into(),
        is_primary_member: member.is_primary_member,
        can_write: member.can_write,
        status: statuses
            .get(&member.user_id)
            .copied()
            .unwrap_or(PresenceStatus::Offline),
    }
}

pub(crate) fn chat_response(
    chat: &Chat,
    members: &[ChatMember],
    statuses: &HashMap<UserId, PresenceStatus>,
    unread_count: i64,
    last_message_id: Option<MessageId>,
) -> ChatResponse {
    ChatResponse {
        id: chat.id,
        chat_type: chat.chat_type.into(),
        match_id: chat.match_id,
        is_closed: chat.is_closed,
        members: members
            .iter()
            .filter(|m| m.chat_id == chat.id)
            .map(|m| member_response(m, statuses))
            .collect(),
        unread_count,
        last_message_id,
    }
}

pub(crate) fn primary_member(chat_id: ChatId, user_id: UserId, role: UserRole) -> NewChatMember {
    NewChatMember {
        chat_id,
        user_id,
        role,
        can_read: true,
        can_write: true,
        is_primary_member: true,
        first_available_message_id: None,
    }
}

impl Messenger {
    async fn chat(&self, chat_id: ChatId) -> ControllerResult<Chat> {
        self.db
            .process(GetChatById { chat_id })
            .await?
            .ok_or(ControllerError::NotFound("chat"))
    }

    pub(crate) async fn membership(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> ControllerResult<Option<ChatMember>> {
        Ok(self.db.process(GetChatMember { chat_id, user_id }).await?)
    }

    /// Open a personal chat between a supervisor and another user.
    ///
    /// Idempotent: an existing chat between the two is returned as is.
    #[tracing::instrument(skip_all, err, fields(user_id = actor.user_id, target_user_id = target_user_id))]
    pub async fn create_chat(
        &self,
        actor: &Actor,
        target_user_id: UserId,
    ) -> ControllerResult<CreateChatResponse> {
        if !actor.is_supervisor() {
            return Err(ControllerError::Forbidden("only supervisors may create chats"));
        }
        if target_user_id == actor.user_id {
            return Err(ControllerError::Unprocessable("cannot chat with yourself"));
        }
        let target = self.known_user(target_user_id).await?;
        let initiator = self.known_user(actor.user_id).await?;

        let pair_key = personal_pair_key(actor.user_id, target_user_id);
        let mut tx = self.db.pool.begin().await?;
        if let Some(chat_id) = Chat::find_by_pair_key_tx(&mut tx, &pair_key).await? {
            return Ok(CreateChatResponse {
                chat_id,
                is_new: false,
            });
        }
        let inserted = Chat::insert_tx(
            &mut tx,
            &NewChat {
                chat_type: ChatType::Personal,
                match_id: None,
                pair_key: Some(pair_key.clone()),
            },
        )
        .await?;
        let Some(chat_id) = inserted else {
            // Lost a race against a concurrent create.
            let chat_id = Chat::find_by_pair_key_tx(&mut tx, &pair_key)
                .await?
                .ok_or(ControllerError::Internal("personal chat vanished".into()))?;
            return Ok(CreateChatResponse {
                chat_id,
                is_new: false,
            });
        };
        ChatMember::insert_tx(&mut tx, &primary_member(chat_id, initiator.id, initiator.role))
            .await?;
        ChatMember::insert_tx(&mut tx, &primary_member(chat_id, target.id, target.role)).await?;
        tx.commit().await?;

        for user_id in [actor.user_id, target_user_id] {
            self.counters.init_chat(user_id, chat_id, 1).await?;
        }
        self.append_system_message(
            chat_id,
            MessageContent::ChatCreated {
                created_by: Some(actor.user_id),
            },
            Some(actor.user_id),
            true,
        )
        .await?;
        self.announce(ServiceUpdate::now(UpdateKind::ChatCreated {
            chat_id,
            chat_type: SdkChatType::Personal,
            created_by_user_id: Some(actor.user_id),
            match_id: None,
        }))
        .await;
        info!(chat_id, "personal chat created");
        Ok(CreateChatResponse {
            chat_id,
            is_new: true,
        })
    }

    #[tracing::instrument(skip_all, err, fields(user_id = actor.user_id, chat_id = chat_id))]
    pub async fn close_chat(&self, actor: &Actor, chat_id: ChatId) -> ControllerResult<()> {
        self.toggle_chat(actor, chat_id, true).await
    }

    #[tracing::instrument(skip_all, err, fields(user_id = actor.user_id, chat_id = chat_id))]
    pub async fn open_chat(&self, actor: &Actor, chat_id: ChatId) -> ControllerResult<()> {
        self.toggle_chat(actor, chat_id, false).await
    }

    async fn toggle_chat(&self, actor: &Actor, chat_id: ChatId, close: bool) -> ControllerResult<()> {
        let mut tx = self.db.pool.begin().await?;
        let chat = Chat::get_for_update_tx(&mut tx, chat_id)
            .await?
            .ok_or(ControllerError::NotFound("chat"))?;
        let membership = ChatMember::get_tx(&mut tx, chat_id, actor.user_id).await?;
        check_toggle(&chat, close, actor, membership.as_ref())?;
        Chat::set_closed_tx(&mut tx, chat_id, close).await?;
        tx.commit().await?;

        let content = if close {
            MessageContent::ChatClosed {
                reason: ChatCloseReason::InitiatedByUser,
            }
        } else {
            MessageContent::ChatOpened {
                reason: ChatOpenReason::InitiatedByUser,
            }
        };
        self.append_system_message(chat_id, content, Some(actor.user_id), false)
            .await?;
        Ok(())
    }

    /// A second bookmaker joins a match chat.
    #[tracing::instrument(skip_all, err, fields(user_id = actor.user_id, chat_id = chat_id))]
    pub async fn join_chat(&self, actor: &Actor, chat_id: ChatId) -> ControllerResult<()> {
        let user = self.known_user(actor.user_id).await?;
        let mut tx = self.db.pool.begin().await?;
        let chat = Chat::get_for_update_tx(&mut tx, chat_id)
            .await?
            .ok_or(ControllerError::NotFound("chat"))?;
        let membership = ChatMember::get_tx(&mut tx, chat_id, actor.user_id).await?;
        check_join(&chat, actor, membership.is_some())?;
        let watermark = Message::last_id_tx(&mut tx, chat_id).await?;
        ChatMember::insert_tx(
            &mut tx,
            &NewChatMember {
                chat_id,
                user_id: actor.user_id,
                role: user.role,
                can_read: true,
                can_write: true,
                is_primary_member: false,
                first_available_message_id: watermark,
            },
        )
        .await?;
        tx.commit().await?;

        self.counters
            .clean_chat(actor.user_id, chat_id, chat.match_id)
            .await?;
        self.append_system_message(
            chat_id,
            MessageContent::UserJoined {
                user_id: actor.user_id,
            },
            Some(actor.user_id),
            false,
        )
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, err, fields(user_id = actor.user_id, chat_id = chat_id))]
    pub async fn leave_chat(&self, actor: &Actor, chat_id: ChatId) -> ControllerResult<()> {
        let mut tx = self.db.pool.begin().await?;
        let chat = Chat::get_for_update_tx(&mut tx, chat_id)
            .await?
            .ok_or(ControllerError::NotFound("chat"))?;
        let membership = ChatMember::get_tx(&mut tx, chat_id, actor.user_id).await?;
        check_leave(&chat, membership.as_ref())?;
        ChatMember::delete_tx(&mut tx, chat_id, actor.user_id).await?;
        tx.commit().await?;

        self.counters
            .clean_chat(actor.user_id, chat_id, chat.match_id)
            .await?;
        self.append_system_message(
            chat_id,
            MessageContent::UserLeft {
                user_id: actor.user_id,
            },
            Some(actor.user_id),
            false,
        )
        .await?;
        Ok(())
    }

    /// A chat with live presence of its members. Supervisors see any chat,
    /// everyone else only chats they belong to.
    pub async fn get_chat(&self, actor: &Actor, chat_id: ChatId) -> ControllerResult<ChatResponse> {
        let chat = self.chat(chat_id).await?;
        let members = self
            .db
            .process(GetChatMembers {
                chat_ids: vec![chat_id],
            })
            .await?;
        if !actor.is_supervisor() && !members.iter().any(|m| m.user_id == actor.user_id) {
            return Err(ControllerError::NotFound("chat"));
        }
        let user_ids: Vec<UserId> = members.iter().map(|m| m.user_id).collect();
        let statuses = self.presence.statuses(&user_ids).await?;
        let unread = self.counters.by_chat(actor.user_id, chat_id).await?;
        let last_message_id = self
            .db
            .process(GetLastMessageIds {
                chat_ids: vec![chat_id],
            })
            .await?
            .first()
            .map(|(_, id)| *id);
        Ok(chat_response(&chat, &members, &statuses, unread, last_message_id))
    }

    pub async fn search_chats(
        &self,
        actor: &Actor,
        query: &SearchChatsQuery,
    ) -> ControllerResult<Vec<ChatResponse>> {
        let chats = self
            .db
            .process(SearchChats {
                user_id: actor.user_id,
                chat_type: query.chat_type.map(Into::into),
                match_id: query.match_id,
                limit: query.limit.clamp(1, 200),
                offset: query.offset.max(0),
            })
            .await?;
        let chat_ids: Vec<ChatId> = chats.iter().map(|c| c.id).collect();
        let members = self
            .db
            .process(GetChatMembers {
                chat_ids: chat_ids.clone(),
            })
            .await?;
        let mut user_ids: Vec<UserId> = members.iter().map(|m| m.user_id).collect();
        user_ids.sort_unstable();
        user_ids.dedup();
        let statuses = self.presence.statuses(&user_ids).await?;
        let unread = self.counters.by_chat_many(actor.user_id, &chat_ids).await?;
        let last_ids: HashMap<ChatId, MessageId> = self
            .db
            .process(GetLastMessageIds {
                chat_ids: chat_ids.clone(),
            })
            .await?
            .into_iter()
            .collect();

        Ok(chats
            .iter()
            .map(|chat| {
                chat_response(
                    chat,
                    &members,
                    &statuses,
                    unread.get(&chat.id).copied().unwrap_or(0),
                    last_ids.get(&chat.id).copied(),
                )
            })
            .collect())
    }

    pub async fn unread_count(&self, actor: &Actor) -> ControllerResult<UnreadCountResponse> {
        let snapshot = self.counters.refresh(actor.user_id).await?;
        Ok(UnreadCountResponse {
            total: snapshot.total,
            by_chat_type: snapshot.by_chat_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::utc_now;

    fn chat(chat_type: ChatType, is_closed: bool) -> Chat {
        Chat {
            id: 1,
            chat_type,
            match_id: (chat_type == ChatType::Match).then_some(10),
            is_closed,
            created_at: utc_now(),
        }
    }

    fn member(user_id: UserId, is_primary_member: bool) -> ChatMember {
        ChatMember {
            chat_id: 1,
            user_id,
            role: UserRole::Bookmaker,
            can_read: true,
            can_write: true,
            is_primary_member,
            is_archive_member: false,
            first_available_message_id: None,
            last_available_message_id: None,
            last_read_message_id: None,
            last_received_message_id: None,
        }
    }

    const BOOKMAKER: Actor = Actor {
        user_id: 5,
        role: Role::Bookmaker,
    };
    const SCOUT: Actor = Actor {
        user_id: 6,
        role: Role::Scout,
    };
    const SUPERVISOR: Actor = Actor {
        user_id: 7,
        role: Role::Supervisor,
    };

    #[test]
    fn test_toggle_conflict_wins_over_chat_type() {
        let closed_match = chat(ChatType::Match, true);
        let err = check_toggle(&closed_match, true, &SUPERVISOR, None).unwrap_err();
        assert!(matches!(err, ControllerError::Conflict(_)));

        let open_match = chat(ChatType::Match, false);
        let err = check_toggle(&open_match, true, &SUPERVISOR, None).unwrap_err();
        assert!(matches!(err, ControllerError::Forbidden(_)));
    }

    #[test]
    fn test_toggle_requires_membership_unless_supervisor() {
        let personal = chat(ChatType::Personal, false);
        assert!(matches!(
            check_toggle(&personal, true, &BOOKMAKER, None),
            Err(ControllerError::Forbidden(_))
        ));
        assert!(check_toggle(&personal, true, &BOOKMAKER, Some(&member(5, true))).is_ok());
        assert!(check_toggle(&personal, true, &SUPERVISOR, None).is_ok());
        assert!(matches!(
            check_toggle(&personal, false, &SUPERVISOR, None),
            Err(ControllerError::Conflict("chat is not closed"))
        ));
    }

    #[test]
    fn test_only_bookmakers_join_match_chats() {
        let match_chat = chat(ChatType::Match, false);
        assert!(check_join(&match_chat, &BOOKMAKER, false).is_ok());
        assert!(matches!(
            check_join(&match_chat, &SCOUT, false),
            Err(ControllerError::Forbidden(_))
        ));
        assert!(matches!(
            check_join(&match_chat, &BOOKMAKER, true),
            Err(ControllerError::Conflict(_))
        ));
        for chat_type in [ChatType::Personal, ChatType::Ticket] {
            assert!(matches!(
                check_join(&chat(chat_type, false), &BOOKMAKER, false),
                Err(ControllerError::Forbidden("chat is not joinable"))
            ));
        }
        assert!(matches!(
            check_join(&chat(ChatType::Match, true), &BOOKMAKER, false),
            Err(ControllerError::Forbidden("chat is closed"))
        ));
    }

    #[test]
    fn test_primary_members_stay_in_match_chats() {
        let match_chat = chat(ChatType::Match, false);
        assert!(matches!(
            check_leave(&match_chat, Some(&member(5, true))),
            Err(ControllerError::Forbidden(_))
        ));
        assert!(check_leave(&match_chat, Some(&member(5, false))).is_ok());
        assert!(check_leave(&chat(ChatType::Personal, false), Some(&member(5, true))).is_ok());
        assert!(matches!(
            check_leave(&match_chat, None),
            Err(ControllerError::Conflict(_))
        ));
        assert!(matches!(
            check_leave(&chat(ChatType::Personal, true), Some(&member(5, true))),
            Err(ControllerError::Forbidden("chat is closed"))
        ));
    }

    #[test]
    fn test_chat_response_annotates_presence() {
        let personal = chat(ChatType::Personal, false);
        let mut other = member(6, true);
        other.chat_id = 2;
        let members = vec![member(5, true), other];
        let statuses = HashMap::from([(5, PresenceStatus::Online)]);

        let response = chat_response(&personal, &members, &statuses, 3, Some(42));
        assert_eq!(response.members.len(), 1);
        assert_eq!(response.members[0].status, PresenceStatus::Online);
        assert_eq!(response.unread_count, 3);
        assert_eq!(response.chat_type, SdkChatType::Personal);
    }

    mod storage {
        use super::*;
        use crate::controllers::testing::TestMessenger;
        use sqlx::PgPool;

        #[sqlx::test(migrations = "../migrations")]
        #[ignore = "needs a Postgres DATABASE_URL"]
        async fn test_create_chat_is_idempotent_per_pair(pool: PgPool) {
            let t = TestMessenger::new(pool);
            let first = t.user(1, Role::Supervisor).await;
            let second = t.user(2, Role::Supervisor).await;

            let created = t.messenger.create_chat(&first, 2).await.unwrap();
            assert!(created.is_new);
            let again = t.messenger.create_chat(&first, 2).await.unwrap();
            let reversed = t.messenger.create_chat(&second, 1).await.unwrap();
            assert_eq!(again.chat_id, created.chat_id);
            assert_eq!(reversed.chat_id, created.chat_id);
            assert!(!again.is_new && !reversed.is_new);

            let chats: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chats WHERE type = 'personal'")
                .fetch_one(&t.pool)
                .await
                .unwrap();
            assert_eq!(chats, 1);
            let members: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM chat_members WHERE chat_id = $1")
                    .bind(created.chat_id)
                    .fetch_one(&t.pool)
                    .await
                    .unwrap();
            assert_eq!(members, 2);
        }

        #[sqlx::test(migrations = "../migrations")]
        #[ignore = "needs a Postgres DATABASE_URL"]
        async fn test_closing_twice_conflicts_and_keeps_chat_closed(pool: PgPool) {
            let t = TestMessenger::new(pool);
            let supervisor = t.user(1, Role::Supervisor).await;
            t.user(2, Role::Scout).await;
            let chat_id = t.messenger.create_chat(&supervisor, 2).await.unwrap().chat_id;

            t.messenger.close_chat(&supervisor, chat_id).await.unwrap();
            let messages_after_close: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE chat_id = $1")
                    .bind(chat_id)
                    .fetch_one(&t.pool)
                    .await
                    .unwrap();

            let err = t.messenger.close_chat(&supervisor, chat_id).await.unwrap_err();
            assert!(matches!(err, ControllerError::Conflict(_)));

            let (is_closed, messages): (bool, i64) = sqlx::query_as(
                "SELECT is_closed, (SELECT COUNT(*) FROM messages WHERE chat_id = $1) \
                 FROM chats WHERE id = $1",
            )
            .bind(chat_id)
            .fetch_one(&t.pool)
            .await
            .unwrap();
            assert!(is_closed);
            assert_eq!(messages, messages_after_close);
        }
    }
}
