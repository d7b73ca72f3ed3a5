//! Redis-backed sorted-set store.
//!
//! Implements [`QueueBackend`] over Redis sorted sets. ZREM is atomic and
//! reports the number of members removed, which gives dequeue races exactly
//! one winner per entry. The connection manager handles reconnection; each
//! operation clones it cheaply.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::backend::{BackendError, QueueBackend, ScoredMember};

/// Redis implementation of [`QueueBackend`].
pub struct RedisQueueBackend {
    redis: ConnectionManager,
}

impl RedisQueueBackend {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - connection URL, e.g. `redis://localhost:6379`
    ///
    /// # Errors
    ///
    /// Returns `BackendError::Connection` when the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, BackendError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        Ok(Self { redis })
    }

    /// Creates a backend from an existing connection manager.
    ///
    /// Useful when sharing a connection pool across components.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

fn op_err(e: redis::RedisError) -> BackendError {
    BackendError::Operation(e.to_string())
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), BackendError> {
        let mut conn = self.redis.clone();
        conn.zadd::<_, _, _, ()>(key, member, score)
            .await
            .map_err(op_err)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, BackendError> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn.zrem(key, member).await.map_err(op_err)?;
        Ok(removed > 0)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, BackendError> {
        let mut conn = self.redis.clone();
        conn.zscore(key, member).await.map_err(op_err)
    }

    async fn ztop(&self, key: &str, count: usize) -> Result<Vec<ScoredMember>, BackendError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let entries: Vec<(String, f64)> = conn
            .zrevrange_withscores(key, 0, count as isize - 1)
            .await
            .map_err(op_err)?;

        Ok(entries
            .into_iter()
            .map(|(member, score)| ScoredMember { member, score })
            .collect())
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64, BackendError> {
        let mut conn = self.redis.clone();
        conn.zcount(key, min, max).await.map_err(op_err)
    }

    async fn zcount_gt(&self, key: &str, score: f64) -> Result<u64, BackendError> {
        let mut conn = self.redis.clone();
        // "(score" is Redis syntax for an exclusive bound.
        conn.zcount(key, format!("({}", score), "+inf")
            .await
            .map_err(op_err)
    }

    async fn zcard(&self, key: &str) -> Result<u64, BackendError> {
        let mut conn = self.redis.clone();
        conn.zcard(key).await.map_err(op_err)
    }

    async fn zscan(&self, key: &str) -> Result<Vec<ScoredMember>, BackendError> {
        let mut conn = self.redis.clone();
        let entries: Vec<(String, f64)> = conn
            .zrange_withscores(key, 0, -1)
            .await
            .map_err(op_err)?;

        Ok(entries
            .into_iter()
            .map(|(member, score)| ScoredMember { member, score })
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut conn = self.redis.clone();
        conn.get(key).await.map_err(op_err)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(key, value).await.map_err(op_err)
    }
}
