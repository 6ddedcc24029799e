use crate::entities::{MatchState, unix_seconds};
use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;
use touchline_sdk::objects::matches::{MatchFields, MatchScout};
use touchline_sdk::objects::{MatchId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct MatchRecord {
    pub sportlevel_id: MatchId,
    pub state: MatchState,
    pub sport: String,
    pub tournament: String,
    pub home_team: String,
    pub away_team: String,
    pub starts_at: time::PrimitiveDateTime,
    /// Bumped on every state write; orders state change events.
    pub state_revision: i64,
}

impl MatchRecord {
    pub fn fields(&self) -> MatchFields {
        MatchFields {
            sport: self.sport.clone(),
            tournament: self.tournament.clone(),
            home_team: self.home_team.clone(),
            away_team: self.away_team.clone(),
            starts_at: unix_seconds(self.starts_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct MatchScoutRecord {
    pub match_id: MatchId,
    pub user_id: UserId,
    pub scout_number: i32,
    pub is_main_scout: bool,
    pub name: String,
}

impl From<MatchScoutRecord> for MatchScout {
    fn from(value: MatchScoutRecord) -> Self {
        MatchScout {
            user_id: value.user_id,
            scout_number: value.scout_number,
            name: value.name,
            is_main_scout: value.is_main_scout,
        }
    }
}

fn to_timestamp(unix: i64) -> Result<time::PrimitiveDateTime, sqlx::Error> {
    let at = time::OffsetDateTime::from_unix_timestamp(unix)
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    Ok(time::PrimitiveDateTime::new(at.date(), at.time()))
}

const MATCH_COLUMNS: &str =
    "sportlevel_id, state, sport, tournament, home_team, away_team, starts_at, state_revision";

#[derive(Debug, Clone)]
pub struct GetMatchById {
    pub match_id: MatchId,
}

impl Processor<GetMatchById> for DatabaseProcessor {
    type Output = Option<MatchRecord>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetMatchById")]
    async fn process(&self, query: GetMatchById) -> Result<Option<MatchRecord>, sqlx::Error> {
        sqlx::query_as::<_, MatchRecord>(&format!(
            "SELECT {MATCH_COLUMNS} FROM matches WHERE sportlevel_id = $1"
        ))
        .bind(query.match_id)
        .fetch_optional(&self.pool)
        .await
    }
}

/// Filtered page of matches.
///
/// `active_states` decides what `is_active` means; a scout only sees the
/// matches they are on the roster of.
#[derive(Debug, Clone)]
pub struct SearchMatches {
    pub is_active: Option<bool>,
    pub active_states: Vec<MatchState>,
    pub search: Option<String>,
    pub scout_user_id: Option<UserId>,
    pub limit: i64,
    pub offset: i64,
}

impl Processor<SearchMatches> for DatabaseProcessor {
    type Output = Vec<MatchRecord>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:SearchMatches")]
    async fn process(&self, query: SearchMatches) -> Result<Vec<MatchRecord>, sqlx::Error> {
        let pattern = query.search.map(|s| format!("%{}%", s.replace('%', "\\%")));
        sqlx::query_as::<_, MatchRecord>(&format!(
            r#"
            SELECT {MATCH_COLUMNS}
            FROM matches
            WHERE ($1::boolean IS NULL OR (state = ANY($2)) = $1)
              AND ($3::text IS NULL
                   OR home_team ILIKE $3 OR away_team ILIKE $3 OR tournament ILIKE $3)
              AND ($4::bigint IS NULL OR EXISTS (
                    SELECT 1 FROM match_scouts s
                    WHERE s.match_id = sportlevel_id AND s.user_id = $4))
            ORDER BY starts_at DESC, sportlevel_id DESC
            LIMIT $5 OFFSET $6
            "#
        ))
        .bind(query.is_active)
        .bind(&query.active_states)
        .bind(pattern)
        .bind(query.scout_user_id)
        .bind(query.limit)
        .bind(query.offset)
        .fetch_all(&self.pool)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct GetMatchScouts {
    pub match_ids: Vec<MatchId>,
}

impl Processor<GetMatchScouts> for DatabaseProcessor {
    type Output = Vec<MatchScoutRecord>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetMatchScouts")]
    async fn process(&self, query: GetMatchScouts) -> Result<Vec<MatchScoutRecord>, sqlx::Error> {
        if query.match_ids.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query_as::<_, MatchScoutRecord>(
            r#"
            SELECT s.match_id, s.user_id, s.scout_number, s.is_main_scout, u.name
            FROM match_scouts s
            JOIN users u ON u.id = s.user_id
            WHERE s.match_id = ANY($1)
            ORDER BY s.match_id, s.is_main_scout DESC, s.scout_number
            "#,
        )
        .bind(&query.match_ids)
        .fetch_all(&self.pool)
        .await
    }
}

impl MatchRecord {
    /// Insert a match within a transaction.
    ///
    /// Returns `false` if the match was already stored (for example by a
    /// concurrent indexing request); the stored row is left untouched.
    pub async fn insert_if_absent_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        match_id: MatchId,
        state: MatchState,
        fields: &MatchFields,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO matches
                (sportlevel_id, state, sport, tournament, home_team, away_team, starts_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (sportlevel_id) DO NOTHING
            "#,
        )
        .bind(match_id)
        .bind(state)
        .bind(&fields.sport)
        .bind(&fields.tournament)
        .bind(&fields.home_team)
        .bind(&fields.away_team)
        .bind(to_timestamp(fields.starts_at)?)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Insert a match or overwrite its descriptive fields, within a
    /// transaction. State and revision of an existing row are kept.
    pub async fn upsert_fields_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        match_id: MatchId,
        state: MatchState,
        fields: &MatchFields,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO matches
                (sportlevel_id, state, sport, tournament, home_team, away_team, starts_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (sportlevel_id) DO UPDATE
            SET sport = EXCLUDED.sport,
                tournament = EXCLUDED.tournament,
                home_team = EXCLUDED.home_team,
                away_team = EXCLUDED.away_team,
                starts_at = EXCLUDED.starts_at,
                updated_at = now() AT TIME ZONE 'utc'
            "#,
        )
        .bind(match_id)
        .bind(state)
        .bind(&fields.sport)
        .bind(&fields.tournament)
        .bind(&fields.home_team)
        .bind(&fields.away_team)
        .bind(to_timestamp(fields.starts_at)?)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Write a new state and bump the revision.
    ///
    /// Returns the new revision and, if the match was marked inactive
    /// before the write, for how many milliseconds.
    pub async fn update_state(
        pool: &sqlx::PgPool,
        match_id: MatchId,
        state: MatchState,
        inactive: bool,
    ) -> Result<Option<(i64, Option<i64>)>, sqlx::Error> {
        sqlx::query_as::<_, (i64, Option<i64>)>(
            r#"
            WITH prev AS (
                SELECT sportlevel_id, deactivated_at
                FROM matches
                WHERE sportlevel_id = $1
                FOR UPDATE
            )
            UPDATE matches m
            SET state = $2,
                state_revision = m.state_revision + 1,
                deactivated_at = CASE
                    WHEN $3 THEN COALESCE(m.deactivated_at, now() AT TIME ZONE 'utc')
                    ELSE NULL
                END,
                updated_at = now() AT TIME ZONE 'utc'
            FROM prev
            WHERE m.sportlevel_id = prev.sportlevel_id
            RETURNING
                m.state_revision,
                (EXTRACT(EPOCH FROM (now() AT TIME ZONE 'utc') - prev.deactivated_at) * 1000)::BIGINT
            "#,
        )
        .bind(match_id)
        .bind(state)
        .bind(inactive)
        .fetch_optional(pool)
        .await
    }

    pub async fn state_revision_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        match_id: MatchId,
    ) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT state_revision FROM matches WHERE sportlevel_id = $1 FOR UPDATE
            "#,
        )
        .bind(match_id)
        .fetch_optional(&mut **tx)
        .await
    }
}

impl MatchScoutRecord {
    /// Replace the roster of a match within a transaction.
    ///
    /// The scouts must already exist as users.
    pub async fn replace_for_match_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        match_id: MatchId,
        scouts: &[MatchScout],
    ) -> Result<(), sqlx::Error> {
        let user_ids: Vec<UserId> = scouts.iter().map(|s| s.user_id).collect();
        let numbers: Vec<i32> = scouts.iter().map(|s| s.scout_number).collect();
        let main: Vec<bool> = scouts.iter().map(|s| s.is_main_scout).collect();

        sqlx::query(
            r#"
            DELETE FROM match_scouts WHERE match_id = $1 AND NOT (user_id = ANY($2))
            "#,
        )
        .bind(match_id)
        .bind(&user_ids)
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO match_scouts (match_id, user_id, scout_number, is_main_scout)
            SELECT $1, * FROM UNNEST($2::bigint[], $3::int[], $4::boolean[])
            ON CONFLICT (match_id, user_id) DO UPDATE
            SET scout_number = EXCLUDED.scout_number,
                is_main_scout = EXCLUDED.is_main_scout
            "#,
        )
        .bind(match_id)
        .bind(&user_ids)
        .bind(&numbers)
        .bind(&main)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn is_scout_of(
        pool: &sqlx::PgPool,
        match_id: MatchId,
        user_id: UserId,
    ) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (SELECT 1 FROM match_scouts WHERE match_id = $1 AND user_id = $2)
            "#,
        )
        .bind(match_id)
        .bind(user_id)
        .fetch_one(pool)
        .await
    }
}
