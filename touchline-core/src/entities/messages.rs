use crate::entities::ChatType;
use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;
use sqlx::types::Json;
use touchline_sdk::objects::{ChatId, MatchId, MessageContent, MessageId, UserId};

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: Option<UserId>,
    pub content: Json<MessageContent>,
    pub reply_to: Option<MessageId>,
    pub created_at: time::PrimitiveDateTime,
}

#[derive(Debug, Clone)]
pub struct InsertMessage {
    pub chat_id: ChatId,
    /// `None` for system notifications.
    pub sender_id: Option<UserId>,
    pub content: MessageContent,
    pub reply_to: Option<MessageId>,
}

impl Processor<InsertMessage> for DatabaseProcessor {
    type Output = Message;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:InsertMessage")]
    async fn process(&self, insert: InsertMessage) -> Result<Message, sqlx::Error> {
        sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO messages (chat_id, sender_id, content, reply_to)
            VALUES ($1, $2, $3, $4)
            RETURNING id, chat_id, sender_id, content, reply_to, created_at
            "#,
        )
        .bind(insert.chat_id)
        .bind(insert.sender_id)
        .bind(Json(&insert.content))
        .bind(insert.reply_to)
        .fetch_one(&self.pool)
        .await
    }
}

/// A page of messages of one chat.
///
/// `min_id` / `max_id` are inclusive visibility bounds of the reader;
/// `from_message_id` is an exclusive cursor.
#[derive(Debug, Clone, Default)]
pub struct GetChatMessages {
    pub chat_id: ChatId,
    pub from_message_id: Option<MessageId>,
    pub backwards: bool,
    pub limit: i64,
    pub min_id: Option<MessageId>,
    pub max_id: Option<MessageId>,
}

impl Processor<GetChatMessages> for DatabaseProcessor {
    type Output = Vec<Message>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetChatMessages")]
    async fn process(&self, query: GetChatMessages) -> Result<Vec<Message>, sqlx::Error> {
        let sql = if query.backwards {
            r#"
            SELECT id, chat_id, sender_id, content, reply_to, created_at
            FROM messages
            WHERE chat_id = $1
              AND ($2::bigint IS NULL OR id < $2)
              AND ($3::bigint IS NULL OR id >= $3)
              AND ($4::bigint IS NULL OR id <= $4)
            ORDER BY id DESC
            LIMIT $5
            "#
        } else {
            r#"
            SELECT id, chat_id, sender_id, content, reply_to, created_at
            FROM messages
            WHERE chat_id = $1
              AND ($2::bigint IS NULL OR id > $2)
              AND ($3::bigint IS NULL OR id >= $3)
              AND ($4::bigint IS NULL OR id <= $4)
            ORDER BY id ASC
            LIMIT $5
            "#
        };
        sqlx::query_as::<_, Message>(sql)
            .bind(query.chat_id)
            .bind(query.from_message_id)
            .bind(query.min_id)
            .bind(query.max_id)
            .bind(query.limit)
            .fetch_all(&self.pool)
            .await
    }
}

/// Last message id of each chat.
#[derive(Debug, Clone)]
pub struct GetLastMessageIds {
    pub chat_ids: Vec<ChatId>,
}

impl Processor<GetLastMessageIds> for DatabaseProcessor {
    type Output = Vec<(ChatId, MessageId)>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetLastMessageIds")]
    async fn process(
        &self,
        query: GetLastMessageIds,
    ) -> Result<Vec<(ChatId, MessageId)>, sqlx::Error> {
        if query.chat_ids.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query_as::<_, (ChatId, MessageId)>(
            r#"
            SELECT chat_id, MAX(id)
            FROM messages
            WHERE chat_id = ANY($1)
            GROUP BY chat_id
            "#,
        )
        .bind(&query.chat_ids)
        .fetch_all(&self.pool)
        .await
    }
}

/// Per-chat unread counts of a user, computed from the read watermarks.
///
/// Messages the user sent and messages outside the member's visibility
/// window are not counted.
#[derive(Debug, Clone)]
pub struct CountUnread {
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UnreadRow {
    pub chat_id: ChatId,
    pub chat_type: ChatType,
    pub match_id: Option<MatchId>,
    pub unread: i64,
}

impl Processor<CountUnread> for DatabaseProcessor {
    type Output = Vec<UnreadRow>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:CountUnread")]
    async fn process(&self, query: CountUnread) -> Result<Vec<UnreadRow>, sqlx::Error> {
        sqlx::query_as::<_, UnreadRow>(
            r#"
            SELECT c.id AS chat_id,
                   c.type AS chat_type,
                   c.match_id,
                   COUNT(m.id) AS unread
            FROM chat_members cm
            JOIN chats c ON c.id = cm.chat_id
            LEFT JOIN messages m
              ON m.chat_id = cm.chat_id
             AND m.id > COALESCE(cm.last_read_message_id, 0)
             AND m.id >= COALESCE(cm.first_available_message_id, 0)
             AND (cm.last_available_message_id IS NULL OR m.id <= cm.last_available_message_id)
             AND m.sender_id IS DISTINCT FROM cm.user_id
            WHERE cm.user_id = $1
            GROUP BY c.id, c.type, c.match_id
            "#,
        )
        .bind(query.user_id)
        .fetch_all(&self.pool)
        .await
    }
}

impl Message {
    pub async fn insert_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        insert: &InsertMessage,
    ) -> Result<Message, sqlx::Error> {
        sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO messages (chat_id, sender_id, content, reply_to)
            VALUES ($1, $2, $3, $4)
            RETURNING id, chat_id, sender_id, content, reply_to, created_at
            "#,
        )
        .bind(insert.chat_id)
        .bind(insert.sender_id)
        .bind(Json(&insert.content))
        .bind(insert.reply_to)
        .fetch_one(&mut **tx)
        .await
    }

    pub async fn last_id_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        chat_id: ChatId,
    ) -> Result<Option<MessageId>, sqlx::Error> {
        sqlx::query_scalar::<_, Option<MessageId>>(
            r#"
            SELECT MAX(id) FROM messages WHERE chat_id = $1
            "#,
        )
        .bind(chat_id)
        .fetch_one(&mut **tx)
        .await
    }

    /// Whether `message_id` belongs to `chat_id`.
    pub async fn exists_in_chat(
        pool: &sqlx::PgPool,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (SELECT 1 FROM messages WHERE id = $1 AND chat_id = $2)
            "#,
        )
        .bind(message_id)
        .bind(chat_id)
        .fetch_one(pool)
        .await
    }
}
