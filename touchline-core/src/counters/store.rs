use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::time::Duration;

/// Integer counters with TTL plus a pub/sub publish.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<i64>, redis::RedisError>;

    async fn set_many(&self, entries: &[(String, i64)], ttl: Duration)
    -> Result<(), redis::RedisError>;

    /// Add `delta` to an existing counter. A missing counter stays missing
    /// and `None` is returned, so a cold counter is never resurrected with
    /// a partial value.
    async fn increment_if_exists(
        &self,
        key: &str,
        delta: i64,
    ) -> Result<Option<i64>, redis::RedisError>;

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), redis::RedisError>;
}

const INCREMENT_IF_EXISTS: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return redis.call('INCRBY', KEYS[1], ARGV[1])
end
return false
"#;

/// [`CounterStore`] on Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    redis: ConnectionManager,
    increment_script: redis::Script,
}

impl RedisCounterStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            increment_script: redis::Script::new(INCREMENT_IF_EXISTS),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> Result<Option<i64>, redis::RedisError> {
        let mut conn = self.redis.clone();
        conn.get(key).await
    }

    async fn set_many(
        &self,
        entries: &[(String, i64)],
        ttl: Duration,
    ) -> Result<(), redis::RedisError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        let seconds = ttl.as_secs().max(1) as usize;
        let mut pipe = redis::pipe();
        for (key, value) in entries {
            pipe.set_ex(key, *value, seconds).ignore();
        }
        pipe.query_async(&mut conn).await
    }

    async fn increment_if_exists(
        &self,
        key: &str,
        delta: i64,
    ) -> Result<Option<i64>, redis::RedisError> {
        let mut conn = self.redis.clone();
        self.increment_script
            .key(key)
            .arg(delta)
            .invoke_async(&mut conn)
            .await
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), redis::RedisError> {
        let mut conn = self.redis.clone();
        conn.publish(channel, payload).await
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct InMemoryCounterStore {
        pub values: Mutex<HashMap<String, i64>>,
        pub published: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl InMemoryCounterStore {
        pub(crate) fn value(&self, key: &str) -> Option<i64> {
            self.values.lock().unwrap().get(key).copied()
        }
    }

    #[async_trait]
    impl CounterStore for InMemoryCounterStore {
        async fn get(&self, key: &str) -> Result<Option<i64>, redis::RedisError> {
            Ok(self.value(key))
        }

        async fn set_many(
            &self,
            entries: &[(String, i64)],
            _ttl: Duration,
        ) -> Result<(), redis::RedisError> {
            let mut values = self.values.lock().unwrap();
            for (key, value) in entries {
                values.insert(key.clone(), *value);
            }
            Ok(())
        }

        async fn increment_if_exists(
            &self,
            key: &str,
            delta: i64,
        ) -> Result<Option<i64>, redis::RedisError> {
            let mut values = self.values.lock().unwrap();
            Ok(values.get_mut(key).map(|v| {
                *v += delta;
                *v
            }))
        }

        async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), redis::RedisError> {
            self.published
                .lock()
                .unwrap()
                .push((channel.to_string(), payload));
            Ok(())
        }
    }
}
