//! Match state synchronizer.
//!
//! The synchronizer is responsible for:
//! - Consuming provider state notifications (match id + external state code)
//! - Reconciling them against the sync cache and the database
//! - Writing state, fields and scout rosters before anything is announced
//! - Emitting `MatchCreated`, `MatchDataChanged`, `MatchScoutsChanged`,
//!   `MatchStateChanged` and `UserDataChanged` onto the bus
//!
//! An active match turning inactive is announced after the configured grace
//! window. Every state write bumps the stored revision, so a match that
//! resumes inside the window makes the delayed announcement stale and the
//! service-updates consumer drops it.

pub(crate) mod store;
mod transition;

pub use store::{CreatedMatch, MatchStore, PgMatchStore, StateWrite, StoredMatch};
pub use transition::{Transition, classify};

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use touchline_sdk::objects::matches::{MatchScout, MatchSnapshot};
use touchline_sdk::objects::updates::{ProviderStateNotification, ServiceUpdate, UpdateKind};
use touchline_sdk::objects::{MatchId, MatchState, Role, UserId};
use tracing::{debug, info, warn};

use crate::bus::{BusError, EventPublisher, HandleError, MessageHandler};
use crate::cache::{MatchCacheData, SyncCache, UserCacheData};
use crate::config::{ConfigStore, SyncSettings};
use crate::provider::{ProviderError, ProviderMatch, SportsDataProvider};

/// Errors that can occur while applying a provider notification.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The external state code is not in the configured table
    #[error("unknown state code {0}")]
    UnknownStateCode(i32),

    /// Inactive to another inactive state
    #[error("unexpected transition of match {match_id} from {from:?} to {to:?}")]
    UnexpectedTransition {
        match_id: MatchId,
        from: MatchState,
        to: MatchState,
    },

    /// Neither the database nor the provider knows the match
    #[error("match {0} not found")]
    NotFound(MatchId),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

/// What applying a notification did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A new match without scouts; not relevant to chat yet.
    Ignored,
    /// The match was stored for the first time.
    Indexed,
    /// Facts were reconciled; `published` events went out.
    Heartbeat { published: usize },
    /// The inactive announcement was scheduled.
    Deactivated { state_revision: i64 },
    /// `announced` is `false` when the resume superseded a pending
    /// inactive announcement.
    Reactivated { announced: bool },
}

pub struct MatchStateSynchronizer {
    settings: ConfigStore<SyncSettings>,
    cache: Arc<SyncCache<MatchId, MatchCacheData>>,
    users: SyncCache<UserId, UserCacheData>,
    store: Arc<dyn MatchStore>,
    provider: Arc<dyn SportsDataProvider>,
    publisher: Arc<dyn EventPublisher>,
}

impl MatchStateSynchronizer {
    pub fn new(
        settings: ConfigStore<SyncSettings>,
        cache: Arc<SyncCache<MatchId, MatchCacheData>>,
        users: SyncCache<UserId, UserCacheData>,
        store: Arc<dyn MatchStore>,
        provider: Arc<dyn SportsDataProvider>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            settings,
            cache,
            users,
            store,
            provider,
            publisher,
        }
    }

    /// Apply one provider notification.
    #[tracing::instrument(skip_all, err, fields(match_id = notification.translation_id))]
    pub async fn apply(
        &self,
        notification: &ProviderStateNotification,
    ) -> Result<SyncOutcome, SyncError> {
        let settings = self.settings.snapshot();
        let match_id = notification.translation_id;
        let new_state = settings
            .resolve(notification.state_id)
            .ok_or(SyncError::UnknownStateCode(notification.state_id))?;

        let Some(mut cached) = self.hydrate(match_id).await? else {
            let Some(found) = self.provider.get_match(match_id).await? else {
                return Err(SyncError::NotFound(match_id));
            };
            if found.scouts.is_empty() {
                debug!(match_id, "match has no scouts, ignoring");
                return Ok(SyncOutcome::Ignored);
            }
            self.index(found, new_state).await?;
            return Ok(SyncOutcome::Indexed);
        };

        let old_state = cached.state;
        match classify(old_state, new_state, &settings) {
            Transition::Heartbeat => {
                if old_state != new_state {
                    let inactive = !settings.is_active(new_state);
                    cached.state_revision = self
                        .write_state(match_id, new_state, inactive)
                        .await?
                        .state_revision;
                    cached.state = new_state;
                }
                let published = self.refresh(match_id, &mut cached).await?;
                self.cache.update(match_id, cached);
                Ok(SyncOutcome::Heartbeat { published })
            }
            Transition::Deactivated => {
                let state_revision = self
                    .write_state(match_id, new_state, true)
                    .await?
                    .state_revision;
                cached.state = new_state;
                cached.state_revision = state_revision;
                self.cache.update(match_id, cached);

                let update = ServiceUpdate::now(UpdateKind::MatchStateChanged {
                    sportlevel_id: match_id,
                    old_state,
                    new_state,
                    state_revision,
                });
                self.publisher
                    .publish_delayed_update(&update, settings.inactive_grace)
                    .await?;
                info!(match_id, ?old_state, ?new_state, state_revision, "match deactivated");
                Ok(SyncOutcome::Deactivated { state_revision })
            }
            Transition::Reactivated => {
                let written = self.write_state(match_id, new_state, false).await?;
                let state_revision = written.state_revision;
                // The delayed inactive announcement may still be in flight.
                let pending = written
                    .inactive_for
                    .is_some_and(|elapsed| elapsed < settings.inactive_grace);
                cached.state = new_state;
                cached.state_revision = state_revision;
                self.refresh(match_id, &mut cached).await?;
                self.cache.update(match_id, cached);

                if pending {
                    info!(match_id, state_revision, "match resumed within grace window");
                    return Ok(SyncOutcome::Reactivated { announced: false });
                }
                let update = ServiceUpdate::now(UpdateKind::MatchStateChanged {
                    sportlevel_id: match_id,
                    old_state,
                    new_state,
                    state_revision,
                });
                self.publisher.publish_update(&update).await?;
                info!(match_id, ?old_state, ?new_state, state_revision, "match reactivated");
                Ok(SyncOutcome::Reactivated { announced: true })
            }
            Transition::Unexpected => Err(SyncError::UnexpectedTransition {
                match_id,
                from: old_state,
                to: new_state,
            }),
        }
    }

    /// Make sure a match known to the provider is stored.
    ///
    /// Used by on-demand indexing from the matches controller. Returns
    /// `None` if the provider does not know the match either.
    pub async fn index_match(&self, match_id: MatchId) -> Result<Option<MatchSnapshot>, SyncError> {
        if let Some(stored) = self.store.load(match_id).await? {
            return Ok(Some(stored.snapshot));
        }
        let Some(found) = self.provider.get_match(match_id).await? else {
            return Ok(None);
        };
        let state = self
            .settings
            .snapshot()
            .resolve(found.state_code)
            .ok_or(SyncError::UnknownStateCode(found.state_code))?;
        self.index(found, state).await.map(Some)
    }

    async fn hydrate(&self, match_id: MatchId) -> Result<Option<MatchCacheData>, SyncError> {
        if let Some(cached) = self.cache.get(&match_id) {
            return Ok(Some(cached));
        }
        let Some(stored) = self.store.load(match_id).await? else {
            return Ok(None);
        };
        let data = MatchCacheData {
            fields: stored.snapshot.fields,
            scouts: stored.snapshot.scouts,
            state: stored.snapshot.state,
            state_revision: stored.state_revision,
        };
        self.cache.update(match_id, data.clone());
        Ok(Some(data))
    }

    async fn write_state(
        &self,
        match_id: MatchId,
        state: MatchState,
        inactive: bool,
    ) -> Result<StateWrite, SyncError> {
        self.store
            .update_state(match_id, state, inactive)
            .await?
            .ok_or(SyncError::NotFound(match_id))
    }

    async fn index(
        &self,
        found: ProviderMatch,
        state: MatchState,
    ) -> Result<MatchSnapshot, SyncError> {
        let match_id = found.sportlevel_id;
        let snapshot = MatchSnapshot {
            sportlevel_id: match_id,
            state,
            fields: found.fields,
            scouts: found.scouts,
        };
        let users = self.unseen_users(&snapshot.scouts);
        let created = self.store.create(&snapshot, &users).await?;
        self.announce_users(&created.changed_users).await?;

        if created.inserted {
            self.publisher
                .publish_update(&ServiceUpdate::now(UpdateKind::MatchCreated {
                    payload: snapshot.clone(),
                }))
                .await?;
            info!(match_id, scouts = snapshot.scouts.len(), "match indexed");
        }
        self.cache.update(
            match_id,
            MatchCacheData {
                fields: snapshot.fields.clone(),
                scouts: snapshot.scouts.clone(),
                state: snapshot.state,
                state_revision: created.state_revision,
            },
        );
        Ok(snapshot)
    }

    /// Re-fetch provider facts and announce whatever differs from `cached`.
    async fn refresh(
        &self,
        match_id: MatchId,
        cached: &mut MatchCacheData,
    ) -> Result<usize, SyncError> {
        let Some(found) = self.provider.get_match(match_id).await? else {
            warn!(match_id, "provider no longer knows a stored match");
            return Ok(0);
        };
        let mut published = 0;

        if cached.is_fields_changed(&found.fields) {
            self.store
                .update_fields(match_id, cached.state, &found.fields)
                .await?;
            self.publisher
                .publish_update(&ServiceUpdate::now(UpdateKind::MatchDataChanged {
                    sportlevel_id: match_id,
                    fields: found.fields.clone(),
                }))
                .await?;
            cached.fields = found.fields;
            published += 1;
        }

        if cached.is_scouts_changed(&found.scouts) {
            let users = self.unseen_users(&found.scouts);
            let changed = self
                .store
                .replace_scouts(match_id, &found.scouts, &users)
                .await?;
            published += self.announce_users(&changed).await?;
            self.publisher
                .publish_update(&ServiceUpdate::now(UpdateKind::MatchScoutsChanged {
                    sportlevel_id: match_id,
                    scouts: found.scouts.clone(),
                }))
                .await?;
            cached.scouts = found.scouts;
            published += 1;
        }
        Ok(published)
    }

    /// Scouts whose user facts are not in the user cache as given.
    fn unseen_users(&self, scouts: &[MatchScout]) -> Vec<MatchScout> {
        scouts
            .iter()
            .filter(|scout| self.users.get(&scout.user_id) != Some(scout_facts(scout)))
            .cloned()
            .collect()
    }

    async fn announce_users(&self, changed: &[MatchScout]) -> Result<usize, SyncError> {
        for scout in changed {
            self.publisher
                .publish_update(&ServiceUpdate::now(UpdateKind::UserDataChanged {
                    user_id: scout.user_id,
                    scout_number: Some(scout.scout_number),
                    name: scout.name.clone(),
                    role: Role::Scout,
                }))
                .await?;
            self.users.update(scout.user_id, scout_facts(scout));
        }
        Ok(changed.len())
    }
}

fn scout_facts(scout: &MatchScout) -> UserCacheData {
    UserCacheData {
        name: scout.name.clone(),
        role: Role::Scout,
        scout_number: Some(scout.scout_number),
    }
}

#[async_trait]
impl MessageHandler for MatchStateSynchronizer {
    type Message = ProviderStateNotification;

    async fn handle(&self, message: ProviderStateNotification) -> Result<(), HandleError> {
        match self.apply(&message).await {
            Ok(outcome) => {
                debug!(?outcome, "provider notification applied");
                Ok(())
            }
            Err(e @ (SyncError::UnknownStateCode(_) | SyncError::NotFound(_))) => {
                Err(HandleError::Drop(e.to_string()))
            }
            Err(e) => Err(HandleError::Failed(e.to_string())),
        }
    }
}
