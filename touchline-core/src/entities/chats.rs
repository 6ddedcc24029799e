use crate::entities::ChatType;
use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;
use touchline_sdk::objects::{ChatId, MatchId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Chat {
    pub id: ChatId,
    #[sqlx(rename = "type")]
    pub chat_type: ChatType,
    pub match_id: Option<MatchId>,
    pub is_closed: bool,
    pub created_at: time::PrimitiveDateTime,
}

/// Uniqueness key of a personal chat between two users, independent of
/// argument order.
pub fn personal_pair_key(a: UserId, b: UserId) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("{low}:{high}")
}

/// Uniqueness key of the chat between a bookmaker and a scout of a match.
pub fn match_pair_key(match_id: MatchId, bookmaker_id: UserId, scout_id: UserId) -> String {
    format!("{match_id}:{bookmaker_id}:{scout_id}")
}

#[derive(Debug, Clone)]
pub struct NewChat {
    pub chat_type: ChatType,
    pub match_id: Option<MatchId>,
    pub pair_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GetChatById {
    pub chat_id: ChatId,
}

impl Processor<GetChatById> for DatabaseProcessor {
    type Output = Option<Chat>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetChatById")]
    async fn process(&self, query: GetChatById) -> Result<Option<Chat>, sqlx::Error> {
        sqlx::query_as::<_, Chat>(
            r#"
            SELECT id, type, match_id, is_closed, created_at
            FROM chats
            WHERE id = $1
            "#,
        )
        .bind(query.chat_id)
        .fetch_optional(&self.pool)
        .await
    }
}

/// Chats the user is a member of, newest activity first.
#[derive(Debug, Clone)]
pub struct SearchChats {
    pub user_id: UserId,
    pub chat_type: Option<ChatType>,
    pub match_id: Option<MatchId>,
    pub limit: i64,
    pub offset: i64,
}

impl Processor<SearchChats> for DatabaseProcessor {
    type Output = Vec<Chat>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:SearchChats")]
    async fn process(&self, query: SearchChats) -> Result<Vec<Chat>, sqlx::Error> {
        sqlx::query_as::<_, Chat>(
            r#"
            SELECT c.id, c.type, c.match_id, c.is_closed, c.created_at
            FROM chats c
            JOIN chat_members cm ON cm.chat_id = c.id AND cm.user_id = $1
            WHERE ($2::chat_type IS NULL OR c.type = $2)
              AND ($3::bigint IS NULL OR c.match_id = $3)
            ORDER BY (SELECT MAX(m.id) FROM messages m WHERE m.chat_id = c.id) DESC NULLS LAST,
                     c.id DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(query.user_id)
        .bind(query.chat_type)
        .bind(query.match_id)
        .bind(query.limit)
        .bind(query.offset)
        .fetch_all(&self.pool)
        .await
    }
}

/// Existing bookmaker↔scout chats of a match.
#[derive(Debug, Clone)]
pub struct GetMatchChatPairs {
    pub match_id: MatchId,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct MatchChatPair {
    pub chat_id: ChatId,
    pub scout_user_id: UserId,
    pub bookmaker_user_id: UserId,
}

impl Processor<GetMatchChatPairs> for DatabaseProcessor {
    type Output = Vec<MatchChatPair>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetMatchChatPairs")]
    async fn process(&self, query: GetMatchChatPairs) -> Result<Vec<MatchChatPair>, sqlx::Error> {
        sqlx::query_as::<_, MatchChatPair>(
            r#"
            SELECT c.id AS chat_id,
                   s.user_id AS scout_user_id,
                   b.user_id AS bookmaker_user_id
            FROM chats c
            JOIN chat_members s
              ON s.chat_id = c.id AND s.is_primary_member AND s.role = 'scout'
            JOIN chat_members b
              ON b.chat_id = c.id AND b.is_primary_member AND b.role = 'bookmaker'
            WHERE c.type = 'match' AND c.match_id = $1
            "#,
        )
        .bind(query.match_id)
        .fetch_all(&self.pool)
        .await
    }
}

impl Chat {
    /// Lock the chat row for the rest of the transaction.
    pub async fn get_for_update_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        chat_id: ChatId,
    ) -> Result<Option<Chat>, sqlx::Error> {
        sqlx::query_as::<_, Chat>(
            r#"
            SELECT id, type, match_id, is_closed, created_at
            FROM chats
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(chat_id)
        .fetch_optional(&mut **tx)
        .await
    }

    /// Insert a chat within a transaction.
    ///
    /// Returns `None` if a chat with the same pair key already exists.
    pub async fn insert_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        new: &NewChat,
    ) -> Result<Option<ChatId>, sqlx::Error> {
        sqlx::query_scalar::<_, ChatId>(
            r#"
            INSERT INTO chats (type, match_id, pair_key)
            VALUES ($1, $2, $3)
            ON CONFLICT (pair_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(new.chat_type)
        .bind(new.match_id)
        .bind(new.pair_key.as_deref())
        .fetch_optional(&mut **tx)
        .await
    }

    pub async fn find_by_pair_key_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        pair_key: &str,
    ) -> Result<Option<ChatId>, sqlx::Error> {
        sqlx::query_scalar::<_, ChatId>(
            r#"
            SELECT id FROM chats WHERE pair_key = $1
            "#,
        )
        .bind(pair_key)
        .fetch_optional(&mut **tx)
        .await
    }

    pub async fn set_closed_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        chat_id: ChatId,
        is_closed: bool,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE chats SET is_closed = $2 WHERE id = $1
            "#,
        )
        .bind(chat_id)
        .bind(is_closed)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_personal_pair_key_is_symmetric() {
        assert_eq!(personal_pair_key(7, 3), personal_pair_key(3, 7));
        assert_eq!(personal_pair_key(3, 7), "3:7");
    }

    #[test]
    fn test_match_pair_key_keeps_roles_apart() {
        assert_ne!(match_pair_key(1, 2, 3), match_pair_key(1, 3, 2));
    }
}
