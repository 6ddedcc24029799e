//! ServiceUpdates processor.
//!
//! Consumes [`ServiceUpdate`]s from the service-updates queue and applies
//! the side effects this service owns:
//! - `MessageSent`: bumps unread counters of every other reader of the chat
//! - `MatchStateChanged`: drops superseded events, archives scout
//!   memberships once a match is over
//! - `MatchCreated` / `MatchScoutsChanged`: upserts the match and roster so
//!   a missed indexing is caught up, and invalidates the cached roster
//!
//! Everything else is acknowledged untouched.

use async_trait::async_trait;
use kanau::processor::Processor;
use std::sync::Arc;
use std::time::Duration;
use touchline_sdk::objects::updates::{ServiceUpdate, UpdateKind};
use touchline_sdk::objects::{ChatId, MatchId, MatchState, UserId};
use tracing::{debug, info, warn};

use crate::bus::{HandleError, MessageHandler};
use crate::cache::Cacher;
use crate::controllers::matches::match_scouts_key;
use crate::counters::UnreadCounters;
use crate::entities::chats::GetChatById;
use crate::entities::members::{ChatMember, GetChatMembers};
use crate::framework::DatabaseProcessor;
use crate::processors::match_sync::MatchStore;

/// An event issued at `event_revision` is stale once the stored revision
/// moved past it.
pub fn is_superseded(event_revision: i64, stored_revision: i64) -> bool {
    event_revision < stored_revision
}

pub fn is_stale(created_at: i64, now: i64, limit: Duration) -> bool {
    now.saturating_sub(created_at) > i64::try_from(limit.as_secs()).unwrap_or(i64::MAX)
}

/// States after which scouts lose write access to the match chats.
pub fn is_final_state(state: MatchState) -> bool {
    matches!(state, MatchState::Finished | MatchState::Cancelled)
}

/// Members whose counters a new message touches.
pub fn message_recipients(members: &[ChatMember], sender_id: Option<UserId>) -> Vec<UserId> {
    members
        .iter()
        .filter(|m| Some(m.user_id) != sender_id && m.can_read && !m.is_archive_member)
        .map(|m| m.user_id)
        .collect()
}

/// The chat facts needed to account for a message.
#[async_trait]
pub trait ChatLookup: Send + Sync {
    /// Match of the chat and its members; `None` if the chat is gone.
    async fn chat_members(
        &self,
        chat_id: ChatId,
    ) -> Result<Option<(Option<MatchId>, Vec<ChatMember>)>, sqlx::Error>;
}

#[async_trait]
impl ChatLookup for DatabaseProcessor {
    async fn chat_members(
        &self,
        chat_id: ChatId,
    ) -> Result<Option<(Option<MatchId>, Vec<ChatMember>)>, sqlx::Error> {
        let Some(chat) = self.process(GetChatById { chat_id }).await? else {
            return Ok(None);
        };
        let members = self
            .process(GetChatMembers {
                chat_ids: vec![chat_id],
            })
            .await?;
        Ok(Some((chat.match_id, members)))
    }
}

pub struct ServiceUpdatesProcessor {
    chats: Arc<dyn ChatLookup>,
    matches: Arc<dyn MatchStore>,
    counters: UnreadCounters,
    cache: Cacher,
    stale_limit: Duration,
}

impl ServiceUpdatesProcessor {
    pub fn new(
        chats: Arc<dyn ChatLookup>,
        matches: Arc<dyn MatchStore>,
        counters: UnreadCounters,
        cache: Cacher,
        stale_limit: Duration,
    ) -> Self {
        Self {
            chats,
            matches,
            counters,
            cache,
            stale_limit,
        }
    }

    async fn on_message_sent(
        &self,
        chat_id: ChatId,
        sender_id: Option<UserId>,
        only_total: bool,
    ) -> Result<(), HandleError> {
        let Some((match_id, members)) = self.chats.chat_members(chat_id).await.map_err(failed)?
        else {
            return Err(HandleError::Drop(format!("chat {chat_id} not found")));
        };
        for user_id in message_recipients(&members, sender_id) {
            self.counters
                .increment_for_message(user_id, chat_id, match_id, only_total)
                .await
                .map_err(failed)?;
        }
        Ok(())
    }

    async fn on_state_changed(
        &self,
        match_id: MatchId,
        new_state: MatchState,
        state_revision: i64,
    ) -> Result<(), HandleError> {
        let Some(stored) = self.matches.state_revision(match_id).await.map_err(failed)? else {
            return Err(HandleError::Drop(format!("match {match_id} not found")));
        };
        if is_superseded(state_revision, stored) {
            info!(match_id, state_revision, stored, "Dropping superseded state change");
            return Ok(());
        }
        if is_final_state(new_state) {
            let archived = self.matches.archive_scouts(match_id).await.map_err(failed)?;
            debug!(match_id, archived, "Archived scout memberships");
        }
        Ok(())
    }
}

fn failed(e: impl std::fmt::Display) -> HandleError {
    HandleError::Failed(e.to_string())
}

#[async_trait]
impl MessageHandler for ServiceUpdatesProcessor {
    type Message = ServiceUpdate;

    #[tracing::instrument(skip_all, fields(update = ?update.update_type()))]
    async fn handle(&self, update: ServiceUpdate) -> Result<(), HandleError> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        if is_stale(update.created_at, now, self.stale_limit) {
            warn!(created_at = update.created_at, "Dropping stale update");
            return Err(HandleError::Drop("stale update".into()));
        }

        match update.kind {
            UpdateKind::MessageSent {
                chat_id,
                sender_id,
                do_not_increment_counter,
                ..
            } => {
                self.on_message_sent(chat_id, sender_id, do_not_increment_counter)
                    .await
            }
            UpdateKind::MatchStateChanged {
                sportlevel_id,
                new_state,
                state_revision,
                ..
            } => {
                self.on_state_changed(sportlevel_id, new_state, state_revision)
                    .await
            }
            UpdateKind::MatchCreated { payload } => {
                self.matches
                    .create(&payload, &payload.scouts)
                    .await
                    .map_err(failed)?;
                self.cache
                    .invalidate_key(&match_scouts_key(payload.sportlevel_id));
                Ok(())
            }
            UpdateKind::MatchScoutsChanged {
                sportlevel_id,
                scouts,
            } => {
                self.matches
                    .replace_scouts(sportlevel_id, &scouts, &scouts)
                    .await
                    .map_err(failed)?;
                self.cache.invalidate_key(&match_scouts_key(sportlevel_id));
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, InMemoryCache};
    use crate::counters::CounterStore;
    use crate::counters::store::fake::InMemoryCounterStore;
    use crate::counters::tests::FakeSource;
    use crate::entities::UserRole;
    use crate::events::counter_update_channel;
    use crate::processors::match_sync::store::fake::FakeMatchStore;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use touchline_sdk::objects::matches::{MatchFields, MatchSnapshot};

    fn member(user_id: UserId, can_read: bool, archived: bool) -> ChatMember {
        ChatMember {
            chat_id: 1,
            user_id,
            role: UserRole::Bookmaker,
            can_read,
            can_write: true,
            is_primary_member: true,
            is_archive_member: archived,
            first_available_message_id: None,
            last_available_message_id: None,
            last_read_message_id: None,
            last_received_message_id: None,
        }
    }

    #[derive(Default)]
    struct FakeChats {
        chats: Mutex<HashMap<ChatId, (Option<MatchId>, Vec<ChatMember>)>>,
    }

    #[async_trait]
    impl ChatLookup for FakeChats {
        async fn chat_members(
            &self,
            chat_id: ChatId,
        ) -> Result<Option<(Option<MatchId>, Vec<ChatMember>)>, sqlx::Error> {
            Ok(self.chats.lock().unwrap().get(&chat_id).cloned())
        }
    }

    struct Harness {
        processor: ServiceUpdatesProcessor,
        matches: Arc<FakeMatchStore>,
        store: Arc<InMemoryCounterStore>,
        cache: Cacher,
    }

    fn harness() -> Harness {
        let chats = Arc::new(FakeChats::default());
        chats
            .chats
            .lock()
            .unwrap()
            .insert(1, (Some(50), vec![member(10, true, false), member(20, true, false)]));
        let matches = Arc::new(FakeMatchStore::default());
        let store = Arc::new(InMemoryCounterStore::default());
        let (tx, _rx) = counter_update_channel(16);
        let counters = UnreadCounters::new(
            store.clone(),
            Arc::new(FakeSource::default()),
            Duration::from_secs(60),
            tx,
        );
        let cache = Cacher::new(Arc::new(InMemoryCache::new(100, 1024)), None);
        let processor = ServiceUpdatesProcessor::new(
            chats,
            matches.clone(),
            counters,
            cache.clone(),
            Duration::from_secs(600),
        );
        Harness {
            processor,
            matches,
            store,
            cache,
        }
    }

    fn snapshot() -> MatchSnapshot {
        MatchSnapshot {
            sportlevel_id: 50,
            state: MatchState::Live,
            fields: MatchFields {
                sport: "football".into(),
                tournament: "Cup".into(),
                home_team: "A".into(),
                away_team: "B".into(),
                starts_at: 0,
            },
            scouts: Vec::new(),
        }
    }

    fn state_changed(new_state: MatchState, state_revision: i64) -> ServiceUpdate {
        ServiceUpdate::now(UpdateKind::MatchStateChanged {
            sportlevel_id: 50,
            old_state: MatchState::Live,
            new_state,
            state_revision,
        })
    }

    #[test]
    fn test_supersede_and_stale_rules() {
        assert!(is_superseded(1, 2));
        assert!(!is_superseded(2, 2));
        assert!(is_stale(0, 601, Duration::from_secs(600)));
        assert!(!is_stale(1, 601, Duration::from_secs(600)));
    }

    #[test]
    fn test_message_recipients_skip_sender_and_archive() {
        let members = vec![
            member(1, true, false),
            member(2, true, false),
            member(3, false, false),
            member(4, true, true),
        ];
        assert_eq!(message_recipients(&members, Some(1)), vec![2]);
        assert_eq!(message_recipients(&members, None), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_message_increments_other_members_only() {
        let h = harness();
        h.store.set_many(
            &[
                ("unread:[by_chat]:20:1".into(), 2),
                ("unread:[total]:20".into(), 5),
                ("unread:[total]:10".into(), 0),
            ],
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        let update = ServiceUpdate::now(UpdateKind::MessageSent {
            initiator_id: Some(10),
            message_id: 100,
            sender_id: Some(10),
            chat_id: 1,
            content_raw: "{}".into(),
            msg_created_at: 0,
            do_not_increment_counter: false,
        });
        h.processor.handle(update).await.unwrap();

        assert_eq!(h.store.value("unread:[by_chat]:20:1"), Some(3));
        assert_eq!(h.store.value("unread:[total]:20"), Some(6));
        assert_eq!(h.store.value("unread:[total]:10"), Some(0));
    }

    #[tokio::test]
    async fn test_message_for_missing_chat_is_dropped() {
        let h = harness();
        let update = ServiceUpdate::now(UpdateKind::MessageSent {
            initiator_id: None,
            message_id: 1,
            sender_id: None,
            chat_id: 404,
            content_raw: "{}".into(),
            msg_created_at: 0,
            do_not_increment_counter: true,
        });
        assert!(matches!(
            h.processor.handle(update).await,
            Err(HandleError::Drop(_))
        ));
    }

    #[tokio::test]
    async fn test_superseded_state_change_does_not_archive() {
        let h = harness();
        h.matches.put(snapshot());
        h.matches.update_state(50, MatchState::Finished, true).await.unwrap();
        h.matches.update_state(50, MatchState::Live, false).await.unwrap();

        h.processor
            .handle(state_changed(MatchState::Finished, 1))
            .await
            .unwrap();
        assert!(h.matches.archived.lock().unwrap().is_empty());

        h.processor
            .handle(state_changed(MatchState::Finished, 2))
            .await
            .unwrap();
        assert_eq!(*h.matches.archived.lock().unwrap(), vec![50]);
    }

    #[tokio::test]
    async fn test_interruption_keeps_scouts() {
        let h = harness();
        h.matches.put(snapshot());
        h.processor
            .handle(state_changed(MatchState::Interrupted, 0))
            .await
            .unwrap();
        assert!(h.matches.archived.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_update_is_dropped() {
        let h = harness();
        let mut update = state_changed(MatchState::Finished, 0);
        update.created_at -= 3_600;
        assert!(matches!(
            h.processor.handle(update).await,
            Err(HandleError::Drop(_))
        ));
    }

    #[tokio::test]
    async fn test_roster_change_invalidates_cached_scouts() {
        let h = harness();
        h.matches.put(snapshot());
        let key: CacheKey = match_scouts_key(50);
        let _: Result<Vec<i64>, std::convert::Infallible> =
            h.cache.cached_func(&key, || async { Ok(vec![1]) }).await;
        assert!(h.cache.invalidate_key(&key));
        let _: Result<Vec<i64>, std::convert::Infallible> =
            h.cache.cached_func(&key, || async { Ok(vec![1]) }).await;

        h.processor
            .handle(ServiceUpdate::now(UpdateKind::MatchScoutsChanged {
                sportlevel_id: 50,
                scouts: Vec::new(),
            }))
            .await
            .unwrap();
        assert!(!h.cache.invalidate_key(&key));
    }
}
