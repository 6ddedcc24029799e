//! Ticket lifecycle: NEW → IN_PROGRESS → SOLVED → CONFIRMED, with SOLVED
//! reopening back to IN_PROGRESS.
//!
//! Every status change is written together with its audit row in one
//! transaction; messages and events follow the commit.

use kanau::processor::Processor;
use std::collections::HashMap;
use touchline_sdk::objects::tickets::{
    CreateTicketRequest, SearchTicketsQuery, TicketCountersResponse, TicketResponse,
};
use touchline_sdk::objects::updates::{ServiceUpdate, UpdateKind};
use touchline_sdk::objects::{
    ChatType as SdkChatType, MessageContent, Role, TicketCloseReason as SdkTicketCloseReason,
    TicketId, TicketStatus as SdkTicketStatus,
};
use tracing::info;

use super::chats::primary_member;
use super::{Actor, ControllerError, ControllerResult, Messenger};
use crate::entities::chats::{Chat, GetChatById, NewChat};
use crate::entities::members::{ChatMember, GetChatMember};
use crate::entities::messages::InsertMessage;
use crate::entities::tickets::{
    GetTicketById, GetTicketCounters, SearchTickets, Ticket, TicketStatusLog,
};
use crate::entities::{ChatType, TicketStatus, UserRole, unix_seconds, utc_now};

/// A requested status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketAction {
    TakeIntoWork,
    Close {
        reason: SdkTicketCloseReason,
        comment: Option<String>,
    },
    Confirm,
    Reopen,
}

/// Target status of `action`, or why it is refused.
///
/// The status is checked before the actor, so a ticket in the wrong state
/// always answers 422 regardless of who asks.
pub fn plan_transition(
    ticket: &Ticket,
    action: &TicketAction,
    actor: &Actor,
    is_member: bool,
) -> ControllerResult<TicketStatus> {
    let assigned_elsewhere = ticket
        .assigned_to_user_id
        .is_some_and(|id| id != actor.user_id);
    match action {
        TicketAction::TakeIntoWork => {
            if ticket.status != TicketStatus::New {
                return Err(ControllerError::Unprocessable("ticket is not new"));
            }
            if !actor.is_supervisor() {
                return Err(ControllerError::Forbidden("only supervisors take tickets"));
            }
            if assigned_elsewhere {
                return Err(ControllerError::Forbidden("ticket is assigned to another user"));
            }
            Ok(TicketStatus::InProgress)
        }
        TicketAction::Close { .. } => {
            if !matches!(ticket.status, TicketStatus::New | TicketStatus::InProgress) {
                return Err(ControllerError::Unprocessable("ticket is not open"));
            }
            if assigned_elsewhere {
                return Err(ControllerError::Forbidden("ticket is assigned to another user"));
            }
            if !is_member && !actor.is_supervisor() {
                return Err(ControllerError::Forbidden("no access to the ticket"));
            }
            Ok(TicketStatus::Solved)
        }
        TicketAction::Confirm | TicketAction::Reopen => {
            if ticket.status != TicketStatus::Solved {
                return Err(ControllerError::Unprocessable("ticket is not solved"));
            }
            if actor.is_supervisor() {
                return Err(ControllerError::Forbidden(
                    "supervisors cannot confirm or reopen tickets",
                ));
            }
            if !is_member {
                return Err(ControllerError::Forbidden("no access to the ticket"));
            }
            Ok(if *action == TicketAction::Confirm {
                TicketStatus::Confirmed
            } else {
                TicketStatus::InProgress
            })
        }
    }
}

/// Whole seconds the ticket spent in its current status.
pub fn time_after_last_status(ticket: &Ticket, now: time::PrimitiveDateTime) -> i64 {
    let since = ticket.updated_at.unwrap_or(ticket.created_at);
    (now - since).whole_seconds().max(0)
}

/// Guard for escalating `source` into a ticket.
pub fn check_ticket_source(
    actor: &Actor,
    source: Option<(&Chat, Option<&ChatMember>)>,
) -> ControllerResult<()> {
    match source {
        None if matches!(actor.role, Role::Scout | Role::Bookmaker) => Ok(()),
        None => Err(ControllerError::Forbidden(
            "only scouts and bookmakers open tickets without a chat",
        )),
        Some((chat, _)) if chat.chat_type != ChatType::Match => Err(
            ControllerError::Unprocessable("tickets cannot be created from this chat"),
        ),
        Some(_) if actor.role != Role::Bookmaker => Err(ControllerError::Forbidden(
            "only the bookmaker can escalate a match chat",
        )),
        Some((_, Some(m))) if m.is_primary_member => Ok(()),
        Some(_) => Err(ControllerError::Forbidden("not a primary member of the chat")),
    }
}

pub fn ticket_response(ticket: Ticket) -> TicketResponse {
    TicketResponse {
        id: ticket.id,
        status: ticket.status.into(),
        chat_id: ticket.chat_id,
        created_from_chat_id: ticket.created_from_chat_id,
        created_by_user_id: ticket.created_by_user_id,
        assigned_to_user_id: ticket.assigned_to_user_id,
        comment: ticket.comment,
        close_reason: ticket.close_reason.map(Into::into),
        created_at: unix_seconds(ticket.created_at),
        updated_at: ticket.updated_at.map(unix_seconds),
    }
}

impl Messenger {
    #[tracing::instrument(skip_all, err, fields(user_id = actor.user_id))]
    pub async fn create_ticket(
        &self,
        actor: &Actor,
        request: CreateTicketRequest,
    ) -> ControllerResult<TicketResponse> {
        let source = match request.created_from_chat_id {
            Some(chat_id) => {
                let chat = self
                    .db
                    .process(GetChatById { chat_id })
                    .await?
                    .ok_or(ControllerError::NotFound("chat"))?;
                let membership = self.membership(chat_id, actor.user_id).await?;
                Some((chat, membership))
            }
            None => None,
        };
        check_ticket_source(actor, source.as_ref().map(|(c, m)| (c, m.as_ref())))?;
        let creator = self.known_user(actor.user_id).await?;
        let source_chat = source.map(|(chat, _)| chat);
        let match_id = source_chat.as_ref().and_then(|c| c.match_id);
        let comment = request.comment.filter(|c| !c.trim().is_empty());

        let mut tx = self.db.pool.begin().await?;
        if let Some(source) = &source_chat
            && Ticket::exists_for_chat_tx(&mut tx, source.id).await?
        {
            return Err(ControllerError::Conflict("a ticket already exists for this chat"));
        }
        let chat_id = Chat::insert_tx(
            &mut tx,
            &NewChat {
                chat_type: ChatType::Ticket,
                match_id,
                pair_key: None,
            },
        )
        .await?
        .ok_or(ControllerError::Internal("ticket chat was not created".into()))?;
        ChatMember::insert_tx(&mut tx, &primary_member(chat_id, creator.id, creator.role)).await?;
        let ticket = Ticket::insert_tx(
            &mut tx,
            chat_id,
            source_chat.as_ref().map(|c| c.id),
            actor.user_id,
            comment.as_deref(),
        )
        .await?
        .ok_or(ControllerError::Conflict("a ticket already exists for this chat"))?;
        TicketStatusLog::insert_tx(
            &mut tx,
            &TicketStatusLog {
                ticket_id: ticket.id,
                old_status: None,
                new_status: TicketStatus::New,
                updated_by: actor.user_id,
                time_after_last_status: 0,
            },
        )
        .await?;
        tx.commit().await?;

        self.counters.init_chat(actor.user_id, chat_id, 0).await?;
        self.append_system_message(
            chat_id,
            MessageContent::TicketCreated {
                ticket_id: ticket.id,
            },
            Some(actor.user_id),
            false,
        )
        .await?;
        if let Some(source) = &source_chat {
            self.append_system_message(
                source.id,
                MessageContent::RelatedTicketCreated {
                    ticket_id: ticket.id,
                    ticket_chat_id: chat_id,
                },
                Some(actor.user_id),
                false,
            )
            .await?;
        }
        if let Some(text) = &comment {
            let message = self
                .db
                .process(InsertMessage {
                    chat_id,
                    sender_id: Some(actor.user_id),
                    content: MessageContent::Text { text: text.clone() },
                    reply_to: None,
                })
                .await?;
            self.announce_message(&message, Some(actor.user_id), false)
                .await;
        }
        self.announce(ServiceUpdate::now(UpdateKind::ChatCreated {
            chat_id,
            chat_type: SdkChatType::Ticket,
            created_by_user_id: Some(actor.user_id),
            match_id,
        }))
        .await;
        self.announce(ServiceUpdate::now(UpdateKind::TicketCreated {
            created_by_user_id: actor.user_id,
            ticket_id: ticket.id,
            match_id,
            chat_id,
        }))
        .await;
        info!(ticket_id = ticket.id, chat_id, "ticket created");
        Ok(ticket_response(ticket))
    }

    #[tracing::instrument(skip_all, err, fields(user_id = actor.user_id, ticket_id = ticket_id))]
    pub async fn take_into_work(&self, actor: &Actor, ticket_id: TicketId) -> ControllerResult<()> {
        self.known_user(actor.user_id).await?;
        self.transition(actor, ticket_id, TicketAction::TakeIntoWork)
            .await
    }

    #[tracing::instrument(skip_all, err, fields(user_id = actor.user_id, ticket_id = ticket_id))]
    pub async fn close_ticket(
        &self,
        actor: &Actor,
        ticket_id: TicketId,
        reason: SdkTicketCloseReason,
        comment: Option<String>,
    ) -> ControllerResult<()> {
        self.transition(actor, ticket_id, TicketAction::Close { reason, comment })
            .await
    }

    #[tracing::instrument(skip_all, err, fields(user_id = actor.user_id, ticket_id = ticket_id))]
    pub async fn confirm_ticket(&self, actor: &Actor, ticket_id: TicketId) -> ControllerResult<()> {
        self.transition(actor, ticket_id, TicketAction::Confirm).await
    }

    #[tracing::instrument(skip_all, err, fields(user_id = actor.user_id, ticket_id = ticket_id))]
    pub async fn reopen_ticket(&self, actor: &Actor, ticket_id: TicketId) -> ControllerResult<()> {
        self.transition(actor, ticket_id, TicketAction::Reopen).await
    }

    async fn transition(
        &self,
        actor: &Actor,
        ticket_id: TicketId,
        action: TicketAction,
    ) -> ControllerResult<()> {
        let mut tx = self.db.pool.begin().await?;
        let ticket = Ticket::get_for_update_tx(&mut tx, ticket_id)
            .await?
            .ok_or(ControllerError::NotFound("ticket"))?;
        let membership = ChatMember::get_tx(&mut tx, ticket.chat_id, actor.user_id).await?;
        let new_status = plan_transition(&ticket, &action, actor, membership.is_some())?;

        match &action {
            TicketAction::TakeIntoWork => {
                Ticket::set_status_tx(&mut tx, ticket.id, new_status, Some(actor.user_id)).await?;
                if membership.is_none() {
                    ChatMember::insert_tx(
                        &mut tx,
                        &primary_member(ticket.chat_id, actor.user_id, UserRole::Supervisor),
                    )
                    .await?;
                }
            }
            TicketAction::Close { reason, comment } => {
                Ticket::close_tx(&mut tx, ticket.id, comment.as_deref(), (*reason).into()).await?;
            }
            TicketAction::Confirm | TicketAction::Reopen => {
                Ticket::set_status_tx(&mut tx, ticket.id, new_status, None).await?;
            }
        }
        TicketStatusLog::insert_tx(
            &mut tx,
            &TicketStatusLog {
                ticket_id: ticket.id,
                old_status: Some(ticket.status),
                new_status,
                updated_by: actor.user_id,
                time_after_last_status: time_after_last_status(&ticket, utc_now()),
            },
        )
        .await?;
        tx.commit().await?;

        match action {
            TicketAction::TakeIntoWork => {
                let match_id = self
                    .db
                    .process(GetChatById {
                        chat_id: ticket.chat_id,
                    })
                    .await?
                    .and_then(|c| c.match_id);
                self.counters
                    .clean_chat(actor.user_id, ticket.chat_id, match_id)
                    .await?;
                self.append_system_message(
                    ticket.chat_id,
                    MessageContent::UserJoined {
                        user_id: actor.user_id,
                    },
                    Some(actor.user_id),
                    false,
                )
                .await?;
            }
            TicketAction::Close { reason, comment } => {
                let closed = MessageContent::TicketClosed {
                    ticket_id: ticket.id,
                    reason,
                    comment,
                };
                if let Some(source) = ticket.created_from_chat_id {
                    self.append_system_message(source, closed.clone(), Some(actor.user_id), false)
                        .await?;
                }
                self.append_system_message(ticket.chat_id, closed, Some(actor.user_id), false)
                    .await?;
            }
            TicketAction::Confirm | TicketAction::Reopen => {}
        }
        self.announce(ServiceUpdate::now(UpdateKind::TicketStatusChanged {
            changed_by_user_id: actor.user_id,
            ticket_id: ticket.id,
            old_status: ticket.status.into(),
            new_status: new_status.into(),
        }))
        .await;
        info!(ticket_id = ticket.id, ?new_status, "ticket status changed");
        Ok(())
    }

    /// A ticket visible to the actor: supervisors see all, everyone else
    /// the tickets whose chat they belong to.
    pub async fn get_ticket(&self, actor: &Actor, ticket_id: TicketId) -> ControllerResult<TicketResponse> {
        let ticket = self
            .db
            .process(GetTicketById { ticket_id })
            .await?
            .ok_or(ControllerError::NotFound("ticket"))?;
        if !actor.is_supervisor()
            && self
                .db
                .process(GetChatMember {
                    chat_id: ticket.chat_id,
                    user_id: actor.user_id,
                })
                .await?
                .is_none()
        {
            return Err(ControllerError::NotFound("ticket"));
        }
        Ok(ticket_response(ticket))
    }

    pub async fn search_tickets(
        &self,
        actor: &Actor,
        query: &SearchTicketsQuery,
    ) -> ControllerResult<Vec<TicketResponse>> {
        let tickets = self
            .db
            .process(SearchTickets {
                user_id: actor.user_id,
                is_supervisor: actor.is_supervisor(),
                status: query.status.map(Into::into),
                limit: query.limit.clamp(1, 200),
                offset: query.offset.max(0),
            })
            .await?;
        Ok(tickets.into_iter().map(ticket_response).collect())
    }

    pub async fn get_ticket_counters(&self, actor: &Actor) -> ControllerResult<TicketCountersResponse> {
        let rows = self
            .db
            .process(GetTicketCounters {
                user_id: actor.user_id,
            })
            .await?;
        let mut by_ticket_status: HashMap<SdkTicketStatus, i64> =
            [(SdkTicketStatus::New, 0), (SdkTicketStatus::InProgress, 0)].into();
        for (status, count) in rows {
            by_ticket_status.insert(status.into(), count);
        }
        Ok(TicketCountersResponse { by_ticket_status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn ticket(status: TicketStatus, assigned_to_user_id: Option<i64>) -> Ticket {
        Ticket {
            id: 1,
            status,
            chat_id: 10,
            created_from_chat_id: Some(5),
            created_by_user_id: 2,
            assigned_to_user_id,
            comment: None,
            close_reason: None,
            created_at: datetime!(2025-03-01 12:00:00),
            updated_at: None,
        }
    }

    fn chat(chat_type: ChatType) -> Chat {
        Chat {
            id: 5,
            chat_type,
            match_id: Some(100),
            is_closed: false,
            created_at: datetime!(2025-03-01 11:00:00),
        }
    }

    fn member(is_primary_member: bool) -> ChatMember {
        ChatMember {
            chat_id: 5,
            user_id: 2,
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

    const SUPERVISOR: Actor = Actor {
        user_id: 1,
        role: Role::Supervisor,
    };
    const BOOKMAKER: Actor = Actor {
        user_id: 2,
        role: Role::Bookmaker,
    };

    fn close() -> TicketAction {
        TicketAction::Close {
            reason: SdkTicketCloseReason::Resolved,
            comment: Some("done".into()),
        }
    }

    #[test]
    fn test_take_into_work() {
        let new = ticket(TicketStatus::New, None);
        assert_eq!(
            plan_transition(&new, &TicketAction::TakeIntoWork, &SUPERVISOR, false).unwrap(),
            TicketStatus::InProgress
        );
        assert!(matches!(
            plan_transition(&new, &TicketAction::TakeIntoWork, &BOOKMAKER, true),
            Err(ControllerError::Forbidden(_))
        ));
        let taken = ticket(TicketStatus::New, Some(9));
        assert!(matches!(
            plan_transition(&taken, &TicketAction::TakeIntoWork, &SUPERVISOR, false),
            Err(ControllerError::Forbidden(_))
        ));
    }

    #[test]
    fn test_status_is_checked_before_permissions() {
        let solved = ticket(TicketStatus::Solved, Some(9));
        assert!(matches!(
            plan_transition(&solved, &TicketAction::TakeIntoWork, &BOOKMAKER, false),
            Err(ControllerError::Unprocessable(_))
        ));
        assert!(matches!(
            plan_transition(&solved, &close(), &BOOKMAKER, false),
            Err(ControllerError::Unprocessable(_))
        ));
    }

    #[test]
    fn test_close_from_new_or_in_progress() {
        let new = ticket(TicketStatus::New, None);
        assert_eq!(
            plan_transition(&new, &close(), &BOOKMAKER, true).unwrap(),
            TicketStatus::Solved
        );
        let mine = ticket(TicketStatus::InProgress, Some(1));
        assert_eq!(
            plan_transition(&mine, &close(), &SUPERVISOR, true).unwrap(),
            TicketStatus::Solved
        );
        assert!(plan_transition(&new, &close(), &BOOKMAKER, false).is_err());
    }

    #[test]
    fn test_confirm_and_reopen_need_a_member() {
        let solved = ticket(TicketStatus::Solved, Some(1));
        assert_eq!(
            plan_transition(&solved, &TicketAction::Confirm, &BOOKMAKER, true).unwrap(),
            TicketStatus::Confirmed
        );
        assert_eq!(
            plan_transition(&solved, &TicketAction::Reopen, &BOOKMAKER, true).unwrap(),
            TicketStatus::InProgress
        );
        assert!(matches!(
            plan_transition(&solved, &TicketAction::Confirm, &BOOKMAKER, false),
            Err(ControllerError::Forbidden(_))
        ));
        assert!(matches!(
            plan_transition(&solved, &TicketAction::Reopen, &SUPERVISOR, true),
            Err(ControllerError::Forbidden(_))
        ));
    }

    #[test]
    fn test_time_after_last_status() {
        let mut t = ticket(TicketStatus::New, None);
        assert_eq!(time_after_last_status(&t, datetime!(2025-03-01 12:01:30)), 90);
        t.updated_at = Some(datetime!(2025-03-01 12:01:00));
        assert_eq!(time_after_last_status(&t, datetime!(2025-03-01 12:01:30)), 30);
        assert_eq!(time_after_last_status(&t, datetime!(2025-03-01 11:00:00)), 0);
    }

    #[test]
    fn test_ticket_sources() {
        let scout = Actor::new(3, Role::Scout);
        assert!(check_ticket_source(&scout, None).is_ok());
        assert!(check_ticket_source(&SUPERVISOR, None).is_err());

        let match_chat = chat(ChatType::Match);
        let primary = member(true);
        assert!(check_ticket_source(&BOOKMAKER, Some((&match_chat, Some(&primary)))).is_ok());
        assert!(matches!(
            check_ticket_source(&BOOKMAKER, Some((&match_chat, Some(&member(false))))),
            Err(ControllerError::Forbidden(_))
        ));
        assert!(matches!(
            check_ticket_source(&scout, Some((&match_chat, None))),
            Err(ControllerError::Forbidden(_))
        ));
        assert!(matches!(
            check_ticket_source(&BOOKMAKER, Some((&chat(ChatType::Personal), Some(&primary)))),
            Err(ControllerError::Unprocessable(_))
        ));
    }

    #[test]
    fn test_ticket_response_converts_timestamps() {
        let mut t = ticket(TicketStatus::Solved, Some(1));
        t.close_reason = Some(crate::entities::TicketCloseReason::Duplicate);
        let response = ticket_response(t);
        assert_eq!(response.status, SdkTicketStatus::Solved);
        assert_eq!(response.close_reason, Some(SdkTicketCloseReason::Duplicate));
        assert_eq!(response.created_at, 1_740_830_400);
        assert_eq!(response.updated_at, None);
    }

    mod storage {
        use super::*;
        use crate::controllers::testing::TestMessenger;
        use sqlx::PgPool;

        async fn log_rows(pool: &PgPool, ticket_id: TicketId) -> i64 {
            sqlx::query_scalar("SELECT COUNT(*) FROM ticket_status_log WHERE ticket_id = $1")
                .bind(ticket_id)
                .fetch_one(pool)
                .await
                .unwrap()
        }

        #[sqlx::test(migrations = "../migrations")]
        #[ignore = "needs a Postgres DATABASE_URL"]
        async fn test_every_status_change_writes_one_log_row(pool: PgPool) {
            let t = TestMessenger::new(pool);
            let scout = t.user(2, Role::Scout).await;
            let supervisor = t.user(1, Role::Supervisor).await;

            let ticket = t
                .messenger
                .create_ticket(
                    &scout,
                    CreateTicketRequest {
                        created_from_chat_id: None,
                        comment: Some("feed is down".into()),
                    },
                )
                .await
                .unwrap();
            assert_eq!(log_rows(&t.pool, ticket.id).await, 1);

            t.messenger.take_into_work(&supervisor, ticket.id).await.unwrap();
            t.messenger
                .close_ticket(&supervisor, ticket.id, SdkTicketCloseReason::Resolved, None)
                .await
                .unwrap();
            t.messenger.reopen_ticket(&scout, ticket.id).await.unwrap();
            assert_eq!(log_rows(&t.pool, ticket.id).await, 4);

            // Refused transitions leave no trace.
            let err = t.messenger.confirm_ticket(&scout, ticket.id).await.unwrap_err();
            assert!(matches!(err, ControllerError::Unprocessable(_)));
            let err = t.messenger.take_into_work(&supervisor, ticket.id).await.unwrap_err();
            assert!(matches!(err, ControllerError::Unprocessable(_)));
            assert_eq!(log_rows(&t.pool, ticket.id).await, 4);

            let statuses: Vec<TicketStatus> = sqlx::query_scalar(
                "SELECT new_status FROM ticket_status_log WHERE ticket_id = $1 ORDER BY id",
            )
            .bind(ticket.id)
            .fetch_all(&t.pool)
            .await
            .unwrap();
            assert_eq!(
                statuses,
                vec![
                    TicketStatus::New,
                    TicketStatus::InProgress,
                    TicketStatus::Solved,
                    TicketStatus::InProgress,
                ]
            );
        }
    }
}
