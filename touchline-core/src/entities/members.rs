use crate::entities::UserRole;
use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;
use touchline_sdk::objects::{ChatId, MatchId, MessageId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ChatMember {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub role: UserRole,
    pub can_read: bool,
    pub can_write: bool,
    pub is_primary_member: bool,
    pub is_archive_member: bool,
    /// Watermark below which a late-joining member cannot read.
    pub first_available_message_id: Option<MessageId>,
    /// Upper read bound of an archived membership.
    pub last_available_message_id: Option<MessageId>,
    pub last_read_message_id: Option<MessageId>,
    pub last_received_message_id: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChatMember {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub role: UserRole,
    pub can_read: bool,
    pub can_write: bool,
    pub is_primary_member: bool,
    pub first_available_message_id: Option<MessageId>,
}

const MEMBER_COLUMNS: &str = "chat_id, user_id, role, can_read, can_write, is_primary_member, \
    is_archive_member, first_available_message_id, last_available_message_id, \
    last_read_message_id, last_received_message_id";

#[derive(Debug, Clone)]
pub struct GetChatMember {
    pub chat_id: ChatId,
    pub user_id: UserId,
}

impl Processor<GetChatMember> for DatabaseProcessor {
    type Output = Option<ChatMember>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetChatMember")]
    async fn process(&self, query: GetChatMember) -> Result<Option<ChatMember>, sqlx::Error> {
        sqlx::query_as::<_, ChatMember>(&format!(
            "SELECT {MEMBER_COLUMNS} FROM chat_members WHERE chat_id = $1 AND user_id = $2"
        ))
        .bind(query.chat_id)
        .bind(query.user_id)
        .fetch_optional(&self.pool)
        .await
    }
}

/// Members of several chats at once.
#[derive(Debug, Clone)]
pub struct GetChatMembers {
    pub chat_ids: Vec<ChatId>,
}

impl Processor<GetChatMembers> for DatabaseProcessor {
    type Output = Vec<ChatMember>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetChatMembers")]
    async fn process(&self, query: GetChatMembers) -> Result<Vec<ChatMember>, sqlx::Error> {
        if query.chat_ids.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query_as::<_, ChatMember>(&format!(
            "SELECT {MEMBER_COLUMNS} FROM chat_members WHERE chat_id = ANY($1) \
             ORDER BY chat_id, is_primary_member DESC, user_id"
        ))
        .bind(&query.chat_ids)
        .fetch_all(&self.pool)
        .await
    }
}

/// Matches for which the user holds an archived chat membership.
#[derive(Debug, Clone)]
pub struct GetArchivedMatchIds {
    pub user_id: UserId,
    pub match_ids: Vec<MatchId>,
}

impl Processor<GetArchivedMatchIds> for DatabaseProcessor {
    type Output = Vec<MatchId>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetArchivedMatchIds")]
    async fn process(&self, query: GetArchivedMatchIds) -> Result<Vec<MatchId>, sqlx::Error> {
        if query.match_ids.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query_scalar::<_, MatchId>(
            r#"
            SELECT DISTINCT c.match_id
            FROM chat_members cm
            JOIN chats c ON c.id = cm.chat_id
            WHERE cm.user_id = $1
              AND cm.is_archive_member
              AND c.type = 'match'
              AND c.match_id = ANY($2)
            "#,
        )
        .bind(query.user_id)
        .bind(&query.match_ids)
        .fetch_all(&self.pool)
        .await
    }
}

impl ChatMember {
    pub async fn get_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<Option<ChatMember>, sqlx::Error> {
        sqlx::query_as::<_, ChatMember>(&format!(
            "SELECT {MEMBER_COLUMNS} FROM chat_members WHERE chat_id = $1 AND user_id = $2"
        ))
        .bind(chat_id)
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await
    }

    /// Add a member within a transaction.
    ///
    /// Returns `false` if the user already was a member.
    pub async fn insert_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        new: &NewChatMember,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO chat_members
                (chat_id, user_id, role, can_read, can_write, is_primary_member,
                 first_available_message_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (chat_id, user_id) DO NOTHING
            "#,
        )
        .bind(new.chat_id)
        .bind(new.user_id)
        .bind(new.role)
        .bind(new.can_read)
        .bind(new.can_write)
        .bind(new.is_primary_member)
        .bind(new.first_available_message_id)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn delete_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM chat_members WHERE chat_id = $1 AND user_id = $2
            "#,
        )
        .bind(chat_id)
        .bind(user_id)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_first_available_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        chat_id: ChatId,
        user_id: UserId,
        message_id: MessageId,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE chat_members
            SET first_available_message_id = $3
            WHERE chat_id = $1 AND user_id = $2
            "#,
        )
        .bind(chat_id)
        .bind(user_id)
        .bind(message_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Turn the scouts of every chat of a match into archive members whose
    /// visibility ends at the chat's current last message.
    pub async fn archive_match_scouts_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        match_id: MatchId,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE chat_members cm
            SET is_archive_member = TRUE,
                can_write = FALSE,
                last_available_message_id =
                    (SELECT MAX(m.id) FROM messages m WHERE m.chat_id = cm.chat_id)
            FROM chats c
            WHERE c.id = cm.chat_id
              AND c.type = 'match'
              AND c.match_id = $1
              AND cm.role = 'scout'
              AND NOT cm.is_archive_member
            "#,
        )
        .bind(match_id)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected())
    }

    /// Advance the read watermark; never moves it backwards.
    ///
    /// Returns `false` if nothing changed.
    pub async fn advance_last_read(
        pool: &sqlx::PgPool,
        chat_id: ChatId,
        user_id: UserId,
        message_id: MessageId,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE chat_members
            SET last_read_message_id = $3,
                last_received_message_id = GREATEST(last_received_message_id, $3)
            WHERE chat_id = $1 AND user_id = $2
              AND (last_read_message_id IS NULL OR last_read_message_id < $3)
            "#,
        )
        .bind(chat_id)
        .bind(user_id)
        .bind(message_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
