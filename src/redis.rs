use crate::error::{ConfigError, DeliveryError};
use crate::sink::KeyValueQueue;
use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};

/// Redis-backed [`KeyValueQueue`] appending payloads with `RPUSH`.
///
/// Connections come from a `deadpool-redis` pool; the pool is built lazily
/// so construction never touches the network and an unreachable Redis only
/// shows up as failed pushes.
#[derive(Clone)]
pub struct RedisQueue {
    pool: Pool,
}

impl RedisQueue {
    /// Build a queue for a Redis URL such as `redis://127.0.0.1:6379/0`.
    pub fn new(url: &str, max_connections: usize) -> Result<Self, ConfigError> {
        let pool = PoolConfig::from_url(url)
            .builder()
            .map_err(|e| ConfigError::KeyValue(format!("invalid redis config: {}", e)))?
            .max_size(max_connections.max(1))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| ConfigError::KeyValue(format!("failed to build redis pool: {}", e)))?;
        Ok(RedisQueue { pool })
    }
}

impl std::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueue")
            .field("status", &self.pool.status())
            .finish()
    }
}

#[async_trait]
impl KeyValueQueue for RedisQueue {
    async fn push(&self, key: &str, payload: String) -> Result<(), DeliveryError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| DeliveryError::KeyValue(format!("failed to get connection: {}", e)))?;

        redis::cmd("RPUSH")
            .arg(key)
            .arg(payload)
            .query_async::<i64>(&mut *conn)
            .await
            .map_err(|e| DeliveryError::KeyValue(format!("RPUSH {} failed: {}", key, e)))?;
        Ok(())
    }
}
