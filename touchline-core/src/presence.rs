//! Online/offline presence of users.
//!
//! The gateway owns presence: it marks a user online when their first
//! connection opens, refreshes the key on client activity and clears it
//! when the last connection closes. Everything else only reads it.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::Duration;
use touchline_sdk::objects::{PresenceStatus, UserId};

pub fn presence_key(user_id: UserId) -> String {
    format!("presence:{user_id}")
}

#[async_trait]
pub trait PresenceService: Send + Sync {
    /// Status of every requested user; unknown users are offline.
    async fn statuses(
        &self,
        user_ids: &[UserId],
    ) -> Result<HashMap<UserId, PresenceStatus>, redis::RedisError>;

    async fn mark_online(&self, user_id: UserId, ttl: Duration) -> Result<(), redis::RedisError>;

    async fn mark_offline(&self, user_id: UserId) -> Result<(), redis::RedisError>;
}

/// [`PresenceService`] over Redis keys with a TTL.
#[derive(Clone)]
pub struct RedisPresence {
    redis: ConnectionManager,
}

impl RedisPresence {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl PresenceService for RedisPresence {
    async fn statuses(
        &self,
        user_ids: &[UserId],
    ) -> Result<HashMap<UserId, PresenceStatus>, redis::RedisError> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.redis.clone();
        let keys: Vec<String> = user_ids.iter().copied().map(presence_key).collect();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;
        Ok(user_ids
            .iter()
            .zip(values)
            .map(|(user_id, value)| {
                let status = if value.is_some() {
                    PresenceStatus::Online
                } else {
                    PresenceStatus::Offline
                };
                (*user_id, status)
            })
            .collect())
    }

    async fn mark_online(&self, user_id: UserId, ttl: Duration) -> Result<(), redis::RedisError> {
        let mut conn = self.redis.clone();
        conn.set_ex(presence_key(user_id), 1, ttl.as_secs().max(1) as usize)
            .await
    }

    async fn mark_offline(&self, user_id: UserId) -> Result<(), redis::RedisError> {
        let mut conn = self.redis.clone();
        conn.del(presence_key(user_id)).await
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct FakePresence {
        pub online: Mutex<HashSet<UserId>>,
    }

    #[async_trait]
    impl PresenceService for FakePresence {
        async fn statuses(
            &self,
            user_ids: &[UserId],
        ) -> Result<HashMap<UserId, PresenceStatus>, redis::RedisError> {
            let online = self.online.lock().unwrap();
            Ok(user_ids
                .iter()
                .map(|id| {
                    let status = if online.contains(id) {
                        PresenceStatus::Online
                    } else {
                        PresenceStatus::Offline
                    };
                    (*id, status)
                })
                .collect())
        }

        async fn mark_online(&self, user_id: UserId, _ttl: Duration) -> Result<(), redis::RedisError> {
            self.online.lock().unwrap().insert(user_id);
            Ok(())
        }

        async fn mark_offline(&self, user_id: UserId) -> Result<(), redis::RedisError> {
            self.online.lock().unwrap().remove(&user_id);
            Ok(())
        }
    }
}
