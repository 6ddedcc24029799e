use crate::entities::UserRole;
use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;
use touchline_sdk::objects::UserId;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub role: UserRole,
    pub scout_number: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct GetUserById {
    pub user_id: UserId,
}

impl Processor<GetUserById> for DatabaseProcessor {
    type Output = Option<User>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetUserById")]
    async fn process(&self, query: GetUserById) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, name, role, scout_number
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(query.user_id)
        .fetch_optional(&self.pool)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct GetUsersByIds {
    pub user_ids: Vec<UserId>,
}

impl Processor<GetUsersByIds> for DatabaseProcessor {
    type Output = Vec<User>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetUsersByIds")]
    async fn process(&self, query: GetUsersByIds) -> Result<Vec<User>, sqlx::Error> {
        if query.user_ids.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, name, role, scout_number
            FROM users
            WHERE id = ANY($1)
            "#,
        )
        .bind(&query.user_ids)
        .fetch_all(&self.pool)
        .await
    }
}

impl User {
    /// Insert or refresh a user, within a transaction.
    ///
    /// Returns `true` when a row was inserted or any of its facts changed.
    pub async fn upsert_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        user: &User,
    ) -> Result<bool, sqlx::Error> {
        let changed = sqlx::query_scalar::<_, UserId>(
            r#"
            INSERT INTO users (id, name, role, scout_number)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                role = EXCLUDED.role,
                scout_number = EXCLUDED.scout_number
            WHERE (users.name, users.role, users.scout_number)
                IS DISTINCT FROM (EXCLUDED.name, EXCLUDED.role, EXCLUDED.scout_number)
            RETURNING id
            "#,
        )
        .bind(user.id)
        .bind(&user.name)
        .bind(user.role)
        .bind(user.scout_number)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(changed.is_some())
    }
}
