use crate::entities::{TicketCloseReason, TicketStatus};
use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;
use touchline_sdk::objects::{ChatId, TicketId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Ticket {
    pub id: TicketId,
    pub status: TicketStatus,
    pub chat_id: ChatId,
    pub created_from_chat_id: Option<ChatId>,
    pub created_by_user_id: UserId,
    pub assigned_to_user_id: Option<UserId>,
    pub comment: Option<String>,
    pub close_reason: Option<TicketCloseReason>,
    pub created_at: time::PrimitiveDateTime,
    pub updated_at: Option<time::PrimitiveDateTime>,
}

/// Audit row written with every status transition.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TicketStatusLog {
    pub ticket_id: TicketId,
    pub old_status: Option<TicketStatus>,
    pub new_status: TicketStatus,
    pub updated_by: UserId,
    /// Seconds spent in `old_status`.
    pub time_after_last_status: i64,
}

const TICKET_COLUMNS: &str = "id, status, chat_id, created_from_chat_id, created_by_user_id, \
    assigned_to_user_id, comment, close_reason, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct GetTicketById {
    pub ticket_id: TicketId,
}

impl Processor<GetTicketById> for DatabaseProcessor {
    type Output = Option<Ticket>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetTicketById")]
    async fn process(&self, query: GetTicketById) -> Result<Option<Ticket>, sqlx::Error> {
        sqlx::query_as::<_, Ticket>(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE id = $1"
        ))
        .bind(query.ticket_id)
        .fetch_optional(&self.pool)
        .await
    }
}

/// Tickets visible to a user: supervisors see every ticket, everyone else
/// only the tickets whose chat they are a member of.
#[derive(Debug, Clone)]
pub struct SearchTickets {
    pub user_id: UserId,
    pub is_supervisor: bool,
    pub status: Option<TicketStatus>,
    pub limit: i64,
    pub offset: i64,
}

impl Processor<SearchTickets> for DatabaseProcessor {
    type Output = Vec<Ticket>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:SearchTickets")]
    async fn process(&self, query: SearchTickets) -> Result<Vec<Ticket>, sqlx::Error> {
        sqlx::query_as::<_, Ticket>(&format!(
            r#"
            SELECT {TICKET_COLUMNS}
            FROM tickets t
            WHERE ($2::ticket_status IS NULL OR t.status = $2)
              AND ($3 OR EXISTS (
                    SELECT 1 FROM chat_members cm
                    WHERE cm.chat_id = t.chat_id AND cm.user_id = $1))
            ORDER BY t.id DESC
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(query.user_id)
        .bind(query.status)
        .bind(query.is_supervisor)
        .bind(query.limit)
        .bind(query.offset)
        .fetch_all(&self.pool)
        .await
    }
}

/// New tickets in the queue and in-progress tickets assigned to the user.
#[derive(Debug, Clone)]
pub struct GetTicketCounters {
    pub user_id: UserId,
}

impl Processor<GetTicketCounters> for DatabaseProcessor {
    type Output = Vec<(TicketStatus, i64)>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetTicketCounters")]
    async fn process(
        &self,
        query: GetTicketCounters,
    ) -> Result<Vec<(TicketStatus, i64)>, sqlx::Error> {
        sqlx::query_as::<_, (TicketStatus, i64)>(
            r#"
            SELECT status, COUNT(*)
            FROM tickets
            WHERE status = 'new'
               OR (status = 'in_progress' AND assigned_to_user_id = $1)
            GROUP BY status
            "#,
        )
        .bind(query.user_id)
        .fetch_all(&self.pool)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct GetTicketStatusLog {
    pub ticket_id: TicketId,
}

impl Processor<GetTicketStatusLog> for DatabaseProcessor {
    type Output = Vec<TicketStatusLog>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetTicketStatusLog")]
    async fn process(
        &self,
        query: GetTicketStatusLog,
    ) -> Result<Vec<TicketStatusLog>, sqlx::Error> {
        sqlx::query_as::<_, TicketStatusLog>(
            r#"
            SELECT ticket_id, old_status, new_status, updated_by, time_after_last_status
            FROM ticket_status_log
            WHERE ticket_id = $1
            ORDER BY id
            "#,
        )
        .bind(query.ticket_id)
        .fetch_all(&self.pool)
        .await
    }
}

impl Ticket {
    pub async fn get_for_update_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        ticket_id: TicketId,
    ) -> Result<Option<Ticket>, sqlx::Error> {
        sqlx::query_as::<_, Ticket>(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE id = $1 FOR UPDATE"
        ))
        .bind(ticket_id)
        .fetch_optional(&mut **tx)
        .await
    }

    pub async fn exists_for_chat_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        created_from_chat_id: ChatId,
    ) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (SELECT 1 FROM tickets WHERE created_from_chat_id = $1)
            "#,
        )
        .bind(created_from_chat_id)
        .fetch_one(&mut **tx)
        .await
    }

    /// Insert a `New` ticket within a transaction.
    ///
    /// Returns `None` if the source chat already has a ticket.
    pub async fn insert_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        chat_id: ChatId,
        created_from_chat_id: Option<ChatId>,
        created_by_user_id: UserId,
        comment: Option<&str>,
    ) -> Result<Option<Ticket>, sqlx::Error> {
        sqlx::query_as::<_, Ticket>(&format!(
            r#"
            INSERT INTO tickets (chat_id, created_from_chat_id, created_by_user_id, comment)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            RETURNING {TICKET_COLUMNS}
            "#
        ))
        .bind(chat_id)
        .bind(created_from_chat_id)
        .bind(created_by_user_id)
        .bind(comment)
        .fetch_optional(&mut **tx)
        .await
    }

    /// Move the ticket to `status`, optionally reassigning it.
    pub async fn set_status_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        ticket_id: TicketId,
        status: TicketStatus,
        assigned_to_user_id: Option<UserId>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE tickets
            SET status = $2,
                assigned_to_user_id = COALESCE($3, assigned_to_user_id),
                updated_at = now() AT TIME ZONE 'utc'
            WHERE id = $1
            "#,
        )
        .bind(ticket_id)
        .bind(status)
        .bind(assigned_to_user_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Solve the ticket, recording why.
    pub async fn close_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        ticket_id: TicketId,
        comment: Option<&str>,
        reason: TicketCloseReason,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE tickets
            SET status = 'solved',
                comment = COALESCE($2, comment),
                close_reason = $3,
                updated_at = now() AT TIME ZONE 'utc'
            WHERE id = $1
            "#,
        )
        .bind(ticket_id)
        .bind(comment)
        .bind(reason)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

impl TicketStatusLog {
    pub async fn insert_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        log: &TicketStatusLog,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO ticket_status_log
                (ticket_id, old_status, new_status, updated_by, time_after_last_status)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(log.ticket_id)
        .bind(log.old_status)
        .bind(log.new_status)
        .bind(log.updated_by)
        .bind(log.time_after_last_status)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}
