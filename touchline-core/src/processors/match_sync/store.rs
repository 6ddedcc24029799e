//! Persistence seam of the match state synchronizer.

use async_trait::async_trait;
use kanau::processor::Processor;
use std::time::Duration;
use touchline_sdk::objects::matches::{MatchFields, MatchScout, MatchSnapshot};
use touchline_sdk::objects::{MatchId, MatchState};

use crate::entities::matches::{GetMatchById, GetMatchScouts, MatchRecord, MatchScoutRecord};
use crate::entities::members::ChatMember;
use crate::entities::users::User;
use crate::entities::{MatchState as DbMatchState, UserRole};
use crate::framework::DatabaseProcessor;

/// A match as stored, with the revision of its state.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMatch {
    pub snapshot: MatchSnapshot,
    pub state_revision: i64,
}

/// Result of [`MatchStore::update_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateWrite {
    pub state_revision: i64,
    /// How long the match had been marked inactive before this write.
    pub inactive_for: Option<Duration>,
}

/// Result of [`MatchStore::create`].
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedMatch {
    /// `false` when the match already existed.
    pub inserted: bool,
    pub state_revision: i64,
    /// Scouts whose user facts were new or changed.
    pub changed_users: Vec<MatchScout>,
}

#[async_trait]
pub trait MatchStore: Send + Sync {
    async fn load(&self, match_id: MatchId) -> Result<Option<StoredMatch>, sqlx::Error>;

    /// Persist a match, its scouts and the scouts' user rows in one
    /// transaction. `users` are the scouts whose user rows need writing.
    async fn create(
        &self,
        snapshot: &MatchSnapshot,
        users: &[MatchScout],
    ) -> Result<CreatedMatch, sqlx::Error>;

    /// Write a new state and bump the revision. Returns `None` if the match
    /// is not stored.
    ///
    /// `inactive` keeps the stored deactivation time (setting it if absent);
    /// otherwise the deactivation time is cleared.
    async fn update_state(
        &self,
        match_id: MatchId,
        state: MatchState,
        inactive: bool,
    ) -> Result<Option<StateWrite>, sqlx::Error>;

    async fn update_fields(
        &self,
        match_id: MatchId,
        state: MatchState,
        fields: &MatchFields,
    ) -> Result<(), sqlx::Error>;

    /// Replace the roster; returns the scouts whose user facts changed.
    async fn replace_scouts(
        &self,
        match_id: MatchId,
        scouts: &[MatchScout],
        users: &[MatchScout],
    ) -> Result<Vec<MatchScout>, sqlx::Error>;

    async fn state_revision(&self, match_id: MatchId) -> Result<Option<i64>, sqlx::Error>;

    /// Turn the scouts of the match's chats into archive members.
    async fn archive_scouts(&self, match_id: MatchId) -> Result<u64, sqlx::Error>;
}

fn stored_state(state: MatchState) -> Result<DbMatchState, sqlx::Error> {
    DbMatchState::try_from(state).map_err(|state| {
        sqlx::Error::Encode(format!("match state {state:?} cannot be stored").into())
    })
}

fn scout_user(scout: &MatchScout) -> User {
    User {
        id: scout.user_id,
        name: scout.name.clone(),
        role: UserRole::Scout,
        scout_number: Some(scout.scout_number),
    }
}

async fn upsert_users_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    users: &[MatchScout],
) -> Result<Vec<MatchScout>, sqlx::Error> {
    let mut changed = Vec::new();
    for scout in users {
        if User::upsert_tx(tx, &scout_user(scout)).await? {
            changed.push(scout.clone());
        }
    }
    Ok(changed)
}

/// [`MatchStore`] on Postgres.
#[derive(Clone)]
pub struct PgMatchStore {
    db: DatabaseProcessor,
}

impl PgMatchStore {
    pub fn new(db: DatabaseProcessor) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MatchStore for PgMatchStore {
    async fn load(&self, match_id: MatchId) -> Result<Option<StoredMatch>, sqlx::Error> {
        let Some(record) = self.db.process(GetMatchById { match_id }).await? else {
            return Ok(None);
        };
        let scouts = self
            .db
            .process(GetMatchScouts {
                match_ids: vec![match_id],
            })
            .await?
            .into_iter()
            .map(MatchScout::from)
            .collect();
        Ok(Some(StoredMatch {
            snapshot: MatchSnapshot {
                sportlevel_id: record.sportlevel_id,
                state: record.state.into(),
                fields: record.fields(),
                scouts,
            },
            state_revision: record.state_revision,
        }))
    }

    async fn create(
        &self,
        snapshot: &MatchSnapshot,
        users: &[MatchScout],
    ) -> Result<CreatedMatch, sqlx::Error> {
        let state = stored_state(snapshot.state)?;
        let mut tx = self.db.pool.begin().await?;
        let changed_users = upsert_users_tx(&mut tx, users).await?;
        let inserted = MatchRecord::insert_if_absent_tx(
            &mut tx,
            snapshot.sportlevel_id,
            state,
            &snapshot.fields,
        )
        .await?;
        if inserted {
            MatchScoutRecord::replace_for_match_tx(&mut tx, snapshot.sportlevel_id, &snapshot.scouts)
                .await?;
        }
        let state_revision = MatchRecord::state_revision_tx(&mut tx, snapshot.sportlevel_id)
            .await?
            .unwrap_or_default();
        tx.commit().await?;
        Ok(CreatedMatch {
            inserted,
            state_revision,
            changed_users,
        })
    }

    async fn update_state(
        &self,
        match_id: MatchId,
        state: MatchState,
        inactive: bool,
    ) -> Result<Option<StateWrite>, sqlx::Error> {
        let written =
            MatchRecord::update_state(&self.db.pool, match_id, stored_state(state)?, inactive)
                .await?;
        Ok(written.map(|(state_revision, inactive_ms)| StateWrite {
            state_revision,
            inactive_for: inactive_ms
                .map(|ms| Duration::from_millis(u64::try_from(ms).unwrap_or(0))),
        }))
    }

    async fn update_fields(
        &self,
        match_id: MatchId,
        state: MatchState,
        fields: &MatchFields,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.db.pool.begin().await?;
        MatchRecord::upsert_fields_tx(&mut tx, match_id, stored_state(state)?, fields).await?;
        tx.commit().await
    }

    async fn replace_scouts(
        &self,
        match_id: MatchId,
        scouts: &[MatchScout],
        users: &[MatchScout],
    ) -> Result<Vec<MatchScout>, sqlx::Error> {
        let mut tx = self.db.pool.begin().await?;
        let changed = upsert_users_tx(&mut tx, users).await?;
        MatchScoutRecord::replace_for_match_tx(&mut tx, match_id, scouts).await?;
        tx.commit().await?;
        Ok(changed)
    }

    async fn state_revision(&self, match_id: MatchId) -> Result<Option<i64>, sqlx::Error> {
        Ok(self
            .db
            .process(GetMatchById { match_id })
            .await?
            .map(|record| record.state_revision))
    }

    async fn archive_scouts(&self, match_id: MatchId) -> Result<u64, sqlx::Error> {
        let mut tx = self.db.pool.begin().await?;
        let archived = ChatMember::archive_match_scouts_tx(&mut tx, match_id).await?;
        tx.commit().await?;
        Ok(archived)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Default)]
    pub(crate) struct FakeMatchStore {
        pub matches: Mutex<HashMap<MatchId, StoredMatch>>,
        pub deactivated: Mutex<HashMap<MatchId, Instant>>,
        pub archived: Mutex<Vec<MatchId>>,
    }

    impl FakeMatchStore {
        pub(crate) fn put(&self, snapshot: MatchSnapshot) {
            self.matches.lock().unwrap().insert(
                snapshot.sportlevel_id,
                StoredMatch {
                    snapshot,
                    state_revision: 0,
                },
            );
        }

        pub(crate) fn get(&self, match_id: MatchId) -> Option<StoredMatch> {
            self.matches.lock().unwrap().get(&match_id).cloned()
        }
    }

    #[async_trait]
    impl MatchStore for FakeMatchStore {
        async fn load(&self, match_id: MatchId) -> Result<Option<StoredMatch>, sqlx::Error> {
            Ok(self.get(match_id))
        }

        async fn create(
            &self,
            snapshot: &MatchSnapshot,
            users: &[MatchScout],
        ) -> Result<CreatedMatch, sqlx::Error> {
            let mut matches = self.matches.lock().unwrap();
            let inserted = !matches.contains_key(&snapshot.sportlevel_id);
            let stored = matches
                .entry(snapshot.sportlevel_id)
                .or_insert_with(|| StoredMatch {
                    snapshot: snapshot.clone(),
                    state_revision: 0,
                });
            Ok(CreatedMatch {
                inserted,
                state_revision: stored.state_revision,
                changed_users: users.to_vec(),
            })
        }

        async fn update_state(
            &self,
            match_id: MatchId,
            state: MatchState,
            inactive: bool,
        ) -> Result<Option<StateWrite>, sqlx::Error> {
            let mut matches = self.matches.lock().unwrap();
            let Some(m) = matches.get_mut(&match_id) else {
                return Ok(None);
            };
            m.snapshot.state = state;
            m.state_revision += 1;

            let now = Instant::now();
            let mut deactivated = self.deactivated.lock().unwrap();
            let inactive_for = deactivated
                .get(&match_id)
                .map(|at| now.saturating_duration_since(*at));
            if inactive {
                deactivated.entry(match_id).or_insert(now);
            } else {
                deactivated.remove(&match_id);
            }
            Ok(Some(StateWrite {
                state_revision: m.state_revision,
                inactive_for,
            }))
        }

        async fn update_fields(
            &self,
            match_id: MatchId,
            _state: MatchState,
            fields: &MatchFields,
        ) -> Result<(), sqlx::Error> {
            if let Some(m) = self.matches.lock().unwrap().get_mut(&match_id) {
                m.snapshot.fields = fields.clone();
            }
            Ok(())
        }

        async fn replace_scouts(
            &self,
            match_id: MatchId,
            scouts: &[MatchScout],
            users: &[MatchScout],
        ) -> Result<Vec<MatchScout>, sqlx::Error> {
            if let Some(m) = self.matches.lock().unwrap().get_mut(&match_id) {
                m.snapshot.scouts = scouts.to_vec();
            }
            Ok(users.to_vec())
        }

        async fn state_revision(&self, match_id: MatchId) -> Result<Option<i64>, sqlx::Error> {
            Ok(self.get(match_id).map(|m| m.state_revision))
        }

        async fn archive_scouts(&self, match_id: MatchId) -> Result<u64, sqlx::Error> {
            self.archived.lock().unwrap().push(match_id);
            Ok(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::PgPool;

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "needs a Postgres DATABASE_URL"]
    async fn test_state_write_reports_time_spent_inactive(pool: PgPool) {
        let store = PgMatchStore::new(DatabaseProcessor::new(pool));
        let snapshot = MatchSnapshot {
            sportlevel_id: 7001,
            state: MatchState::Live,
            fields: MatchFields {
                sport: "football".into(),
                tournament: "Premier".into(),
                home_team: "Home".into(),
                away_team: "Away".into(),
                starts_at: 1_718_000_000,
            },
            scouts: Vec::new(),
        };
        store.create(&snapshot, &[]).await.unwrap();

        let interrupted = store
            .update_state(7001, MatchState::Interrupted, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(interrupted.state_revision, 1);
        assert_eq!(interrupted.inactive_for, None);

        let resumed = store
            .update_state(7001, MatchState::Live, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resumed.state_revision, 2);
        assert!(resumed.inactive_for.is_some_and(|d| d < Duration::from_secs(60)));

        let again = store
            .update_state(7001, MatchState::Live, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.inactive_for, None);
        assert_eq!(store.update_state(404, MatchState::Live, false).await.unwrap(), None);
    }
}
