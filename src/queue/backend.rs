//! Sorted-set backend capability for the priority queue.
//!
//! The queue does not talk to Redis directly; it talks to this trait. The
//! contract mirrors the sorted-set primitives the queue needs: add with
//! score, conditional remove (the at-most-one-winner primitive that dequeue
//! races rely on), score lookup, descending top-k, score-range counts,
//! cardinality, and a full scan for the anti-starvation pass. Plain get/set
//! cover the adjacent config keyspace.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors surfaced by a queue backend. Transient by nature; callers decide
/// whether to retry.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend connection failed: {0}")]
    Connection(String),

    #[error("backend operation failed: {0}")]
    Operation(String),
}

/// A member of a sorted set together with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

/// Key-value store with atomic sorted-set primitives.
///
/// Implementations must make `zrem` atomic with respect to concurrent
/// removers: exactly one caller observes `true` for a given member.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Adds or overwrites a member with the given score.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), BackendError>;

    /// Removes a member. Returns whether the member was present.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, BackendError>;

    /// Returns the member's score, if present.
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, BackendError>;

    /// Up to `count` members with the highest scores, descending.
    async fn ztop(&self, key: &str, count: usize) -> Result<Vec<ScoredMember>, BackendError>;

    /// Number of members with score in `[min, max]` (inclusive).
    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64, BackendError>;

    /// Number of members with score strictly greater than `score`.
    async fn zcount_gt(&self, key: &str, score: f64) -> Result<u64, BackendError>;

    /// Cardinality of the set.
    async fn zcard(&self, key: &str) -> Result<u64, BackendError>;

    /// Every member with its score, in unspecified order.
    async fn zscan(&self, key: &str) -> Result<Vec<ScoredMember>, BackendError>;

    /// Reads a plain value.
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    /// Writes a plain value.
    async fn set(&self, key: &str, value: &str) -> Result<(), BackendError>;
}

#[derive(Default)]
struct MemoryState {
    sets: HashMap<String, HashMap<String, f64>>,
    values: HashMap<String, String>,
}

/// In-memory implementation of [`QueueBackend`] for tests and local runs.
///
/// A single lock guards all keys, which trivially provides the conditional
/// remove atomicity the trait requires.
#[derive(Default)]
pub struct MemoryQueueBackend {
    state: RwLock<MemoryState>,
}

impl MemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueueBackend {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), BackendError> {
        let mut state = self.state.write().await;
        state
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, BackendError> {
        let mut state = self.state.write().await;
        Ok(state
            .sets
            .get_mut(key)
            .map(|set| set.remove(member).is_some())
            .unwrap_or(false))
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, BackendError> {
        let state = self.state.read().await;
        Ok(state.sets.get(key).and_then(|set| set.get(member).copied()))
    }

    async fn ztop(&self, key: &str, count: usize) -> Result<Vec<ScoredMember>, BackendError> {
        let state = self.state.read().await;
        let Some(set) = state.sets.get(key) else {
            return Ok(Vec::new());
        };
        let mut members: Vec<ScoredMember> = set
            .iter()
            .map(|(member, score)| ScoredMember {
                member: member.clone(),
                score: *score,
            })
            .collect();
        members.sort_by(|a, b| b.score.total_cmp(&a.score));
        members.truncate(count);
        Ok(members)
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64, BackendError> {
        let state = self.state.read().await;
        Ok(state
            .sets
            .get(key)
            .map(|set| {
                set.values()
                    .filter(|score| **score >= min && **score <= max)
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn zcount_gt(&self, key: &str, score: f64) -> Result<u64, BackendError> {
        let state = self.state.read().await;
        Ok(state
            .sets
            .get(key)
            .map(|set| set.values().filter(|s| **s > score).count() as u64)
            .unwrap_or(0))
    }

    async fn zcard(&self, key: &str) -> Result<u64, BackendError> {
        let state = self.state.read().await;
        Ok(state.sets.get(key).map(|set| set.len() as u64).unwrap_or(0))
    }

    async fn zscan(&self, key: &str) -> Result<Vec<ScoredMember>, BackendError> {
        let state = self.state.read().await;
        Ok(state
            .sets
            .get(key)
            .map(|set| {
                set.iter()
                    .map(|(member, score)| ScoredMember {
                        member: member.clone(),
                        score: *score,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let state = self.state.read().await;
        Ok(state.values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        let mut state = self.state.write().await;
        state.values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_zadd_overwrites() {
        let backend = MemoryQueueBackend::new();
        backend.zadd("k", "a", 1.0).await.unwrap();
        backend.zadd("k", "a", 2.0).await.unwrap();
        assert_eq!(backend.zscore("k", "a").await.unwrap(), Some(2.0));
        assert_eq!(backend.zcard("k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_zrem_reports_presence() {
        let backend = MemoryQueueBackend::new();
        backend.zadd("k", "a", 1.0).await.unwrap();
        assert!(backend.zrem("k", "a").await.unwrap());
        assert!(!backend.zrem("k", "a").await.unwrap());
        assert!(!backend.zrem("missing", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_ztop_descending() {
        let backend = MemoryQueueBackend::new();
        backend.zadd("k", "low", 1.0).await.unwrap();
        backend.zadd("k", "high", 3.0).await.unwrap();
        backend.zadd("k", "mid", 2.0).await.unwrap();

        let top = backend.ztop("k", 2).await.unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].member, "high");
        assert_eq!(top[1].member, "mid");
    }

    #[tokio::test]
    async fn test_zcount_ranges() {
        let backend = MemoryQueueBackend::new();
        for (m, s) in [("a", 1.0), ("b", 2.0), ("c", 3.0)] {
            backend.zadd("k", m, s).await.unwrap();
        }
        assert_eq!(backend.zcount("k", 1.0, 2.0).await.unwrap(), 2);
        assert_eq!(backend.zcount_gt("k", 1.0).await.unwrap(), 2);
        assert_eq!(backend.zcount_gt("k", 3.0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_plain_get_set() {
        let backend = MemoryQueueBackend::new();
        assert_eq!(backend.get("cfg").await.unwrap(), None);
        backend.set("cfg", "{}").await.unwrap();
        assert_eq!(backend.get("cfg").await.unwrap(), Some("{}".to_string()));
    }
}
