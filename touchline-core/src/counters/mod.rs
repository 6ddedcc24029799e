//! Unread message counters.
//!
//! Counters live in Redis per (user, chat), per (user, match) and per user
//! total. They are incremented and decremented independently of message
//! ids, because who counts a message as unread depends on the chat type. A
//! missing counter is never guessed: it is recomputed from the read
//! watermarks in the database, which is the source of truth.
//!
//! Every change of a user's total is queued for the
//! [`CounterPublisher`], which pushes it to the user's pub/sub channel.

mod publisher;
pub(crate) mod store;

pub use publisher::CounterPublisher;
pub use store::{CounterStore, RedisCounterStore};

#[cfg(test)]
pub(crate) use store::fake;

use async_trait::async_trait;
use kanau::processor::Processor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use touchline_sdk::objects::proto::UnreadCountersUpdate;
use touchline_sdk::objects::{ChatId, ChatType, MatchId, UserId};
use tracing::warn;

use crate::cache::CacheKey;
use crate::entities::messages::{CountUnread, UnreadRow};
use crate::events::CounterUpdateSender;
use crate::framework::DatabaseProcessor;

#[derive(Debug, Error)]
pub enum CounterError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Pub/sub channel carrying a user's [`UnreadCountersUpdate`]s.
pub fn counters_channel(user_id: UserId) -> String {
    format!("unread-counters-updates:{user_id}")
}

fn chat_key(user_id: UserId, chat_id: ChatId) -> String {
    CacheKey::template("unread:[by_chat]:{user_id}:{chat_id}")
        .kwarg("user_id", user_id)
        .kwarg("chat_id", chat_id)
        .render()
}

fn match_key(user_id: UserId, match_id: MatchId) -> String {
    CacheKey::template("unread:[by_match]:{user_id}:{match_id}")
        .kwarg("user_id", user_id)
        .kwarg("match_id", match_id)
        .render()
}

fn total_key(user_id: UserId) -> String {
    CacheKey::template("unread:[total]:{user_id}")
        .kwarg("user_id", user_id)
        .render()
}

/// Where cold counters are recomputed from.
#[async_trait]
pub trait UnreadSource: Send + Sync {
    async fn count_unread(&self, user_id: UserId) -> Result<Vec<UnreadRow>, sqlx::Error>;
}

#[async_trait]
impl UnreadSource for DatabaseProcessor {
    async fn count_unread(&self, user_id: UserId) -> Result<Vec<UnreadRow>, sqlx::Error> {
        self.process(CountUnread { user_id }).await
    }
}

/// Counters of one user recomputed from the database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnreadSnapshot {
    pub total: i64,
    pub by_chat: HashMap<ChatId, i64>,
    pub by_match: HashMap<MatchId, i64>,
    pub by_chat_type: HashMap<ChatType, i64>,
}

impl UnreadSnapshot {
    fn from_rows(rows: &[UnreadRow]) -> Self {
        let mut snapshot = UnreadSnapshot::default();
        for chat_type in ChatType::ALL {
            snapshot.by_chat_type.insert(chat_type, 0);
        }
        for row in rows {
            snapshot.total += row.unread;
            snapshot.by_chat.insert(row.chat_id, row.unread);
            if let Some(match_id) = row.match_id {
                *snapshot.by_match.entry(match_id).or_default() += row.unread;
            }
            *snapshot
                .by_chat_type
                .entry(row.chat_type.into())
                .or_default() += row.unread;
        }
        snapshot
    }
}

#[derive(Clone)]
pub struct UnreadCounters {
    store: Arc<dyn CounterStore>,
    source: Arc<dyn UnreadSource>,
    ttl: Duration,
    updates_tx: CounterUpdateSender,
}

impl UnreadCounters {
    pub fn new(
        store: Arc<dyn CounterStore>,
        source: Arc<dyn UnreadSource>,
        ttl: Duration,
        updates_tx: CounterUpdateSender,
    ) -> Self {
        Self {
            store,
            source,
            ttl,
            updates_tx,
        }
    }

    /// Recompute every counter of the user from the database and cache it.
    pub async fn refresh(&self, user_id: UserId) -> Result<UnreadSnapshot, CounterError> {
        let rows = self.source.count_unread(user_id).await?;
        let snapshot = UnreadSnapshot::from_rows(&rows);

        let mut entries: Vec<(String, i64)> = Vec::with_capacity(rows.len() * 2 + 1);
        entries.extend(
            snapshot
                .by_chat
                .iter()
                .map(|(chat_id, n)| (chat_key(user_id, *chat_id), *n)),
        );
        entries.extend(
            snapshot
                .by_match
                .iter()
                .map(|(match_id, n)| (match_key(user_id, *match_id), *n)),
        );
        entries.push((total_key(user_id), snapshot.total));
        self.store.set_many(&entries, self.ttl).await?;
        Ok(snapshot)
    }

    pub async fn total(&self, user_id: UserId) -> Result<i64, CounterError> {
        match self.store.get(&total_key(user_id)).await? {
            Some(total) => Ok(total),
            None => Ok(self.refresh(user_id).await?.total),
        }
    }

    pub async fn by_chat(&self, user_id: UserId, chat_id: ChatId) -> Result<i64, CounterError> {
        Ok(self
            .by_chat_many(user_id, &[chat_id])
            .await?
            .get(&chat_id)
            .copied()
            .unwrap_or(0))
    }

    /// Counters of several chats; one database recount covers all misses.
    pub async fn by_chat_many(
        &self,
        user_id: UserId,
        chat_ids: &[ChatId],
    ) -> Result<HashMap<ChatId, i64>, CounterError> {
        self.many(chat_ids, |id| chat_key(user_id, id), || async {
            Ok::<_, CounterError>(self.refresh(user_id).await?.by_chat)
        })
        .await
    }

    pub async fn by_match_many(
        &self,
        user_id: UserId,
        match_ids: &[MatchId],
    ) -> Result<HashMap<MatchId, i64>, CounterError> {
        self.many(match_ids, |id| match_key(user_id, id), || async {
            Ok::<_, CounterError>(self.refresh(user_id).await?.by_match)
        })
        .await
    }

    async fn many<F, R, Fut>(
        &self,
        ids: &[i64],
        key: F,
        recount: R,
    ) -> Result<HashMap<i64, i64>, CounterError>
    where
        F: Fn(i64) -> String,
        R: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<HashMap<i64, i64>, CounterError>>,
    {
        let mut found = HashMap::with_capacity(ids.len());
        let mut missing = false;
        for id in ids {
            match self.store.get(&key(*id)).await? {
                Some(n) => {
                    found.insert(*id, n);
                }
                None => missing = true,
            }
        }
        if missing {
            let recounted = recount().await?;
            for id in ids {
                found
                    .entry(*id)
                    .or_insert_with(|| recounted.get(id).copied().unwrap_or(0));
            }
        }
        Ok(found)
    }

    /// Set a fresh chat's counter, e.g. to 1 for the creation message of a
    /// personal chat. The total follows when that message is accounted.
    pub async fn init_chat(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        value: i64,
    ) -> Result<(), CounterError> {
        self.store
            .set_many(&[(chat_key(user_id, chat_id), value)], self.ttl)
            .await?;
        Ok(())
    }

    /// Zero the user's counters of a chat (and its match) and subtract
    /// what was unread from the total. Returns the removed amount.
    pub async fn clean_chat(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        match_id: Option<MatchId>,
    ) -> Result<i64, CounterError> {
        let removed = self.by_chat(user_id, chat_id).await?;
        let mut entries = vec![(chat_key(user_id, chat_id), 0)];
        if let Some(match_id) = match_id {
            entries.push((match_key(user_id, match_id), 0));
        }
        self.store.set_many(&entries, self.ttl).await?;
        if removed != 0 {
            self.adjust_total(user_id, -removed).await?;
        }
        Ok(removed)
    }

    /// Account for one new message in a chat the user is a member of.
    ///
    /// With `only_total` the chat and match counters are left alone.
    pub async fn increment_for_message(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        match_id: Option<MatchId>,
        only_total: bool,
    ) -> Result<(), CounterError> {
        if !only_total {
            self.store
                .increment_if_exists(&chat_key(user_id, chat_id), 1)
                .await?;
            if let Some(match_id) = match_id {
                self.store
                    .increment_if_exists(&match_key(user_id, match_id), 1)
                    .await?;
            }
        }
        match self.store.increment_if_exists(&total_key(user_id), 1).await? {
            Some(total) => self.notify(user_id, total).await,
            None => {
                let total = self.refresh(user_id).await?.total;
                self.notify(user_id, total).await;
            }
        }
        Ok(())
    }

    /// Add `delta` to a cached total, clamping at zero, and announce it.
    /// A cold total is left for the next read to recompute.
    pub async fn adjust_total(&self, user_id: UserId, delta: i64) -> Result<(), CounterError> {
        let key = total_key(user_id);
        match self.store.increment_if_exists(&key, delta).await? {
            Some(total) if total < 0 => {
                self.store.set_many(&[(key, 0)], self.ttl).await?;
                self.notify(user_id, 0).await;
            }
            Some(total) => self.notify(user_id, total).await,
            None => {}
        }
        Ok(())
    }

    /// Recount after the read watermark moved and announce the new total.
    pub async fn reset_after_read(&self, user_id: UserId) -> Result<i64, CounterError> {
        let total = self.refresh(user_id).await?.total;
        self.notify(user_id, total).await;
        Ok(total)
    }

    async fn notify(&self, user_id: UserId, total: i64) {
        let update = UnreadCountersUpdate {
            user_id: Some(user_id),
            unread_count: total,
        };
        if self.updates_tx.send(update).await.is_err() {
            warn!(user_id, "Counter update queue closed");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::entities::ChatType as DbChatType;
    use crate::events::{CounterUpdateReceiver, default_counter_update_channel};
    use fake::InMemoryCounterStore;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct FakeSource {
        pub rows: Mutex<Vec<UnreadRow>>,
        pub calls: Mutex<u32>,
    }

    #[async_trait]
    impl UnreadSource for FakeSource {
        async fn count_unread(&self, _user_id: UserId) -> Result<Vec<UnreadRow>, sqlx::Error> {
            *self.calls.lock().unwrap() += 1;
            Ok(self.rows.lock().unwrap().clone())
        }
    }

    fn row(chat_id: ChatId, match_id: Option<MatchId>, unread: i64) -> UnreadRow {
        UnreadRow {
            chat_id,
            chat_type: if match_id.is_some() {
                DbChatType::Match
            } else {
                DbChatType::Personal
            },
            match_id,
            unread,
        }
    }

    fn counters(
        rows: Vec<UnreadRow>,
    ) -> (
        UnreadCounters,
        Arc<InMemoryCounterStore>,
        Arc<FakeSource>,
        CounterUpdateReceiver,
    ) {
        let store = Arc::new(InMemoryCounterStore::default());
        let source = Arc::new(FakeSource::default());
        *source.rows.lock().unwrap() = rows;
        let (tx, rx) = default_counter_update_channel();
        let counters = UnreadCounters::new(
            store.clone(),
            source.clone(),
            Duration::from_secs(60),
            tx,
        );
        (counters, store, source, rx)
    }

    #[tokio::test]
    async fn test_cold_total_is_recounted_once() {
        let (counters, store, source, _rx) =
            counters(vec![row(1, None, 2), row(2, Some(9), 3)]);

        assert_eq!(counters.total(7).await.unwrap(), 5);
        assert_eq!(counters.total(7).await.unwrap(), 5);
        assert_eq!(*source.calls.lock().unwrap(), 1);
        assert_eq!(store.value("unread:[by_chat]:7:2"), Some(3));
        assert_eq!(store.value("unread:[by_match]:7:9"), Some(3));
    }

    #[tokio::test]
    async fn test_message_increments_warm_counters_and_announces_total() {
        let (counters, store, _source, mut rx) = counters(vec![row(2, Some(9), 1)]);
        counters.refresh(7).await.unwrap();

        counters.increment_for_message(7, 2, Some(9), false).await.unwrap();

        assert_eq!(store.value("unread:[by_chat]:7:2"), Some(2));
        assert_eq!(store.value("unread:[by_match]:7:9"), Some(2));
        assert_eq!(store.value("unread:[total]:7"), Some(2));
        let update = rx.recv().await.unwrap();
        assert_eq!(update.user_id, Some(7));
        assert_eq!(update.unread_count, 2);
    }

    #[tokio::test]
    async fn test_only_total_leaves_chat_counter() {
        let (counters, store, _source, _rx) = counters(vec![row(2, None, 0)]);
        counters.refresh(7).await.unwrap();

        counters.increment_for_message(7, 2, None, true).await.unwrap();

        assert_eq!(store.value("unread:[by_chat]:7:2"), Some(0));
        assert_eq!(store.value("unread:[total]:7"), Some(1));
    }

    #[tokio::test]
    async fn test_clean_chat_subtracts_from_total() {
        let (counters, store, _source, mut rx) =
            counters(vec![row(1, None, 2), row(2, Some(9), 3)]);
        counters.refresh(7).await.unwrap();

        let removed = counters.clean_chat(7, 2, Some(9)).await.unwrap();

        assert_eq!(removed, 3);
        assert_eq!(store.value("unread:[by_chat]:7:2"), Some(0));
        assert_eq!(store.value("unread:[by_match]:7:9"), Some(0));
        assert_eq!(store.value("unread:[total]:7"), Some(2));
        assert_eq!(rx.recv().await.unwrap().unread_count, 2);
    }

    #[tokio::test]
    async fn test_total_never_goes_negative() {
        let (counters, store, _source, mut rx) = counters(vec![row(1, None, 1)]);
        counters.refresh(7).await.unwrap();

        counters.adjust_total(7, -4).await.unwrap();

        assert_eq!(store.value("unread:[total]:7"), Some(0));
        assert_eq!(rx.recv().await.unwrap().unread_count, 0);
    }

    #[test]
    fn test_snapshot_counts_every_chat_type() {
        let snapshot = UnreadSnapshot::from_rows(&[row(1, None, 2), row(2, Some(9), 3)]);
        assert_eq!(snapshot.by_chat_type[&ChatType::Personal], 2);
        assert_eq!(snapshot.by_chat_type[&ChatType::Match], 3);
        assert_eq!(snapshot.by_chat_type[&ChatType::Ticket], 0);
    }
}
