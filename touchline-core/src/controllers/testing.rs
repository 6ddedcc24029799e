//! Messenger wired to a real database and in-memory fakes for everything
//! else. Used by the storage tests of the controllers.

use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use touchline_sdk::objects::{Role, UserId};

use super::{Actor, Messenger};
use crate::bus::memory::InMemoryBus;
use crate::cache::{Cacher, InMemoryCache, SyncCache};
use crate::config::{ConfigStore, SyncSettings};
use crate::counters::UnreadCounters;
use crate::counters::fake::InMemoryCounterStore;
use crate::entities::users::User;
use crate::events::{CounterUpdateReceiver, default_counter_update_channel};
use crate::framework::DatabaseProcessor;
use crate::presence::fake::FakePresence;
use crate::processors::match_sync::{MatchStateSynchronizer, PgMatchStore};
use crate::provider::fake::FakeProvider;

pub(crate) struct TestMessenger {
    pub messenger: Messenger,
    pub pool: PgPool,
    pub bus: Arc<InMemoryBus>,
    _counter_updates: CounterUpdateReceiver,
}

impl TestMessenger {
    pub(crate) fn new(pool: PgPool) -> Self {
        let db = DatabaseProcessor::new(pool.clone());
        let bus = Arc::new(InMemoryBus::new());
        let provider = Arc::new(FakeProvider::default());
        let sync_settings = ConfigStore::new(SyncSettings::default());
        let (counter_tx, counter_rx) = default_counter_update_channel();
        let counters = UnreadCounters::new(
            Arc::new(InMemoryCounterStore::default()),
            Arc::new(db.clone()),
            Duration::from_secs(60),
            counter_tx,
        );
        let sync = MatchStateSynchronizer::new(
            sync_settings.clone(),
            Arc::new(SyncCache::new(100, None)),
            SyncCache::new(100, None),
            Arc::new(PgMatchStore::new(db.clone())),
            provider.clone(),
            bus.clone(),
        );
        let messenger = Messenger {
            db,
            publisher: bus.clone(),
            counters,
            presence: Arc::new(FakePresence::default()),
            cache: Cacher::new(Arc::new(InMemoryCache::new(100, 64 * 1024)), None),
            provider,
            sync: Arc::new(sync),
            sync_settings,
        };
        Self {
            messenger,
            pool,
            bus,
            _counter_updates: counter_rx,
        }
    }

    /// Store a user and return it as the acting caller.
    pub(crate) async fn user(&self, user_id: UserId, role: Role) -> Actor {
        let mut tx = self.pool.begin().await.unwrap();
        User::upsert_tx(
            &mut tx,
            &User {
                id: user_id,
                name: format!("user {user_id}"),
                role: role.into(),
                scout_number: (role == Role::Scout).then_some(1),
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        Actor::new(user_id, role)
    }
}
