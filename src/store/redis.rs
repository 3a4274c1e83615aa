use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::{KvError, KvStore};

/// Redis-backed store. The connection manager reconnects on its own;
/// individual command failures surface as `KvError` for the callers'
/// degradation policies (circuit breaker, fail-closed quota).
pub struct RedisKv {
    manager: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }
}

impl From<redis::RedisError> for KvError {
    fn from(err: redis::RedisError) -> Self {
        KvError::Store(err.to_string())
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut con = self.manager.clone();
        Ok(con.get(key).await?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut con = self.manager.clone();
        con.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        let mut con = self.manager.clone();
        con.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn get_del(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut con = self.manager.clone();
        Ok(con.get_del(key).await?)
    }

    async fn incr_pair(
        &self,
        first: &str,
        second: &str,
        by: i64,
        first_ttl: Duration,
        second_ttl: Duration,
    ) -> Result<(i64, i64), KvError> {
        let mut con = self.manager.clone();
        let (a, b): (i64, i64) = redis::pipe()
            .atomic()
            .incr(first, by)
            .incr(second, by)
            .expire(first, first_ttl.as_secs() as i64)
            .ignore()
            .expire(second, second_ttl.as_secs() as i64)
            .ignore()
            .query_async(&mut con)
            .await?;
        Ok((a, b))
    }
}
