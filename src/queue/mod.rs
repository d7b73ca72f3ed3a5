//! Sharded priority queue.
//!
//! The queue is an index over item ids: `shard_count` independent sorted
//! sets, each mapping `id -> score`. An id hashes to exactly one shard;
//! global ordering is reconstructed at dequeue time by peeking across
//! shards and merging by score.
//!
//! Ordering: strictly higher priority first, then FIFO by enqueue time
//! within a priority (see [`score`]). Dequeue is optimistic: peek, select
//! the global best, attempt an atomic conditional remove, and retry from
//! the peek when another worker won the race. No cross-shard lock exists.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, BTreeMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::item::{ItemId, Priority};

pub mod backend;
pub mod redis;
pub mod score;
pub mod starvation;

pub use backend::{BackendError, MemoryQueueBackend, QueueBackend, ScoredMember};
pub use redis::RedisQueueBackend;
pub use starvation::StarvationDaemon;

/// A starving entry gains one priority level per this much overrun past its
/// wait threshold.
pub const ELEVATION_STEP: Duration = Duration::from_secs(300);

/// Errors returned by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The id has no entry in the queue.
    #[error("item {0} is not in the queue")]
    NotInQueue(ItemId),

    /// A member stored in a shard is not a valid item id.
    #[error("invalid queue member '{0}'")]
    InvalidMember(String),

    /// The backend failed; transient.
    #[error("queue backend error: {0}")]
    Backend(#[from] BackendError),

    /// The cancellation token fired mid-operation.
    #[error("queue operation cancelled")]
    Cancelled,
}

/// One entry of the queue index: the id plus its derived ordering data.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub id: ItemId,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    pub score: f64,
}

impl QueueEntry {
    fn from_scored(member: &ScoredMember) -> Result<Self, QueueError> {
        let id = ItemId::parse(&member.member)
            .map_err(|_| QueueError::InvalidMember(member.member.clone()))?;
        let (priority, enqueued_at) = score::decode(member.score);
        Ok(Self {
            id,
            priority,
            enqueued_at,
            score: member.score,
        })
    }
}

/// Sharded priority queue over an injected sorted-set backend.
#[derive(Clone)]
pub struct PriorityQueue {
    backend: Arc<dyn QueueBackend>,
    shard_count: usize,
}

impl PriorityQueue {
    /// Creates a queue over `backend` with `shard_count` shards. The shard
    /// count is fixed for the lifetime of the keyspace; changing it
    /// rehashes ids into different shards.
    pub fn new(backend: Arc<dyn QueueBackend>, shard_count: usize) -> Self {
        Self {
            backend,
            shard_count: shard_count.max(1),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Stable shard index for an id: h = h * 31 + byte over the id string,
    /// wrapping in 32 bits, absolute value, mod shard count.
    fn shard_index(&self, id: ItemId) -> usize {
        let mut hash: i32 = 0;
        for byte in id.to_string().bytes() {
            hash = (byte as i32).wrapping_add(hash.wrapping_shl(5).wrapping_sub(hash));
        }
        hash.unsigned_abs() as usize % self.shard_count
    }

    fn shard_key(&self, id: ItemId) -> String {
        format!("queue:shard:{}", self.shard_index(id))
    }

    fn shard_key_at(&self, index: usize) -> String {
        format!("queue:shard:{}", index)
    }

    fn check_cancelled(token: &CancellationToken) -> Result<(), QueueError> {
        if token.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        Ok(())
    }

    /// Adds an item with `enqueued_at = now`. Re-enqueueing an id that is
    /// already present overwrites its score (idempotent).
    pub async fn enqueue(
        &self,
        token: &CancellationToken,
        id: ItemId,
        priority: Priority,
    ) -> Result<(), QueueError> {
        self.enqueue_at(token, id, priority, Utc::now()).await
    }

    /// Adds an item with an explicit enqueue timestamp.
    ///
    /// Used by the dispatcher to return undeliverable entries without
    /// resetting their FIFO age, and by tests to build deterministic
    /// orderings.
    pub async fn enqueue_at(
        &self,
        token: &CancellationToken,
        id: ItemId,
        priority: Priority,
        enqueued_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        Self::check_cancelled(token)?;
        let key = self.shard_key(id);
        let score = score::encode(priority, enqueued_at);
        self.backend.zadd(&key, &id.to_string(), score).await?;
        debug!(item_id = %id, priority = %priority, shard = %key, "Enqueued item");
        Ok(())
    }

    /// Removes and returns the globally best entry, or `None` when every
    /// shard is empty.
    ///
    /// Protocol: peek the top of every shard, select the highest score,
    /// attempt the conditional remove, and retry from the peek if another
    /// worker claimed that entry first.
    pub async fn dequeue(
        &self,
        token: &CancellationToken,
    ) -> Result<Option<QueueEntry>, QueueError> {
        loop {
            Self::check_cancelled(token)?;

            let mut best: Option<(usize, ScoredMember)> = None;
            for shard in 0..self.shard_count {
                let top = self.backend.ztop(&self.shard_key_at(shard), 1).await?;
                if let Some(candidate) = top.into_iter().next() {
                    let better = match &best {
                        Some((_, current)) => candidate.score > current.score,
                        None => true,
                    };
                    if better {
                        best = Some((shard, candidate));
                    }
                }
            }

            let Some((shard, member)) = best else {
                return Ok(None);
            };

            let removed = self
                .backend
                .zrem(&self.shard_key_at(shard), &member.member)
                .await?;
            if !removed {
                // Lost the race to another worker; peek again.
                debug!(member = %member.member, "Dequeue race lost, retrying");
                continue;
            }

            return Ok(Some(QueueEntry::from_scored(&member)?));
        }
    }

    /// Removes and returns up to `batch_size` entries in global score
    /// order. Entries lost to concurrent removers are silently dropped
    /// from the result.
    pub async fn dequeue_batch(
        &self,
        token: &CancellationToken,
        batch_size: usize,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        Self::check_cancelled(token)?;
        let selected = self.merged_top(batch_size).await?;

        let mut entries = Vec::with_capacity(selected.len());
        for (shard, member) in selected {
            Self::check_cancelled(token)?;
            let removed = self
                .backend
                .zrem(&self.shard_key_at(shard), &member.member)
                .await?;
            if !removed {
                continue;
            }
            match QueueEntry::from_scored(&member) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(error = %e, "Dropping unparseable queue member"),
            }
        }
        Ok(entries)
    }

    /// Returns up to `count` entries in dispatch order without removing
    /// them.
    pub async fn peek_next(
        &self,
        token: &CancellationToken,
        count: usize,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        Self::check_cancelled(token)?;
        let selected = self.merged_top(count).await?;

        let mut entries = Vec::with_capacity(selected.len());
        for (_, member) in selected {
            match QueueEntry::from_scored(&member) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(error = %e, "Skipping unparseable queue member"),
            }
        }
        Ok(entries)
    }

    /// K-way merge of the per-shard descending top-k lists. Returns up to
    /// `k` `(shard, member)` pairs in descending score order.
    async fn merged_top(&self, k: usize) -> Result<Vec<(usize, ScoredMember)>, QueueError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut per_shard: Vec<Vec<ScoredMember>> = Vec::with_capacity(self.shard_count);
        for shard in 0..self.shard_count {
            per_shard.push(self.backend.ztop(&self.shard_key_at(shard), k).await?);
        }

        struct HeapEntry {
            score: i64,
            shard: usize,
            index: usize,
        }
        impl PartialEq for HeapEntry {
            fn eq(&self, other: &Self) -> bool {
                self.score == other.score
            }
        }
        impl Eq for HeapEntry {}
        impl PartialOrd for HeapEntry {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }
        impl Ord for HeapEntry {
            fn cmp(&self, other: &Self) -> Ordering {
                self.score.cmp(&other.score)
            }
        }

        let mut heap = BinaryHeap::new();
        for (shard, members) in per_shard.iter().enumerate() {
            if let Some(first) = members.first() {
                heap.push(HeapEntry {
                    score: first.score as i64,
                    shard,
                    index: 0,
                });
            }
        }

        let mut selected = Vec::with_capacity(k);
        while selected.len() < k {
            let Some(top) = heap.pop() else { break };
            selected.push((top.shard, per_shard[top.shard][top.index].clone()));
            let next_index = top.index + 1;
            if let Some(next) = per_shard[top.shard].get(next_index) {
                heap.push(HeapEntry {
                    score: next.score as i64,
                    shard: top.shard,
                    index: next_index,
                });
            }
        }
        Ok(selected)
    }

    /// Rewrites the priority band of a queued entry, preserving its age
    /// component so the item keeps its FIFO position within the new band.
    pub async fn update_priority(
        &self,
        token: &CancellationToken,
        id: ItemId,
        new_priority: Priority,
    ) -> Result<(), QueueError> {
        Self::check_cancelled(token)?;
        let key = self.shard_key(id);
        let current = self
            .backend
            .zscore(&key, &id.to_string())
            .await?
            .ok_or(QueueError::NotInQueue(id))?;

        let updated = score::with_priority(current, new_priority);
        self.backend.zadd(&key, &id.to_string(), updated).await?;
        debug!(item_id = %id, priority = %new_priority, "Updated queue priority");
        Ok(())
    }

    /// Removes an entry. Fails with `NotInQueue` when the id is absent.
    pub async fn remove(&self, token: &CancellationToken, id: ItemId) -> Result<(), QueueError> {
        Self::check_cancelled(token)?;
        let removed = self.backend.zrem(&self.shard_key(id), &id.to_string()).await?;
        if !removed {
            return Err(QueueError::NotInQueue(id));
        }
        Ok(())
    }

    /// 1-indexed global rank of an entry: the number of entries with a
    /// strictly greater score across all shards, plus one. Approximate
    /// while the queue is mutating concurrently.
    pub async fn position(&self, token: &CancellationToken, id: ItemId) -> Result<u64, QueueError> {
        Self::check_cancelled(token)?;
        let target = self
            .backend
            .zscore(&self.shard_key(id), &id.to_string())
            .await?
            .ok_or(QueueError::NotInQueue(id))?;

        let mut ahead = 0u64;
        for shard in 0..self.shard_count {
            ahead += self
                .backend
                .zcount_gt(&self.shard_key_at(shard), target)
                .await?;
        }
        Ok(ahead + 1)
    }

    /// Total number of queued entries across all shards.
    pub async fn len(&self, token: &CancellationToken) -> Result<u64, QueueError> {
        Self::check_cancelled(token)?;
        let mut total = 0u64;
        for shard in 0..self.shard_count {
            total += self.backend.zcard(&self.shard_key_at(shard)).await?;
        }
        Ok(total)
    }

    /// Entry counts per priority level, computed with per-shard range
    /// counts over each priority band.
    pub async fn size_by_priority(
        &self,
        token: &CancellationToken,
    ) -> Result<BTreeMap<Priority, u64>, QueueError> {
        Self::check_cancelled(token)?;
        let mut sizes = BTreeMap::new();
        for priority in Priority::all() {
            let (min, max) = score::band_range(priority);
            let mut count = 0u64;
            for shard in 0..self.shard_count {
                count += self
                    .backend
                    .zcount(&self.shard_key_at(shard), min, max)
                    .await?;
            }
            sizes.insert(priority, count);
        }
        Ok(sizes)
    }

    /// One anti-starvation pass: elevates every entry whose wait exceeds
    /// `max_wait` by one priority level per [`ELEVATION_STEP`] of overrun,
    /// capped at the maximum priority and preserving FIFO age. Returns the
    /// number of entries boosted.
    ///
    /// Concurrent priority writers may interleave; last writer wins and a
    /// later pass converges the result. Entries already at the top priority
    /// are skipped.
    pub async fn boost_starving(
        &self,
        token: &CancellationToken,
        max_wait: Duration,
    ) -> Result<u64, QueueError> {
        let now = Utc::now();
        let mut boosted = 0u64;

        for shard in 0..self.shard_count {
            Self::check_cancelled(token)?;
            let key = self.shard_key_at(shard);
            for member in self.backend.zscan(&key).await? {
                let (priority, enqueued_at) = score::decode(member.score);
                if priority == Priority::HIGH {
                    continue;
                }

                let age = (now - enqueued_at).to_std().unwrap_or(Duration::ZERO);
                if age <= max_wait {
                    continue;
                }

                let overrun = age - max_wait;
                let steps = (overrun.as_secs() / ELEVATION_STEP.as_secs()).min(u8::MAX as u64);
                let elevated = priority.boosted(steps as u8);
                if elevated <= priority {
                    continue;
                }

                let updated = score::with_priority(member.score, elevated);
                self.backend.zadd(&key, &member.member, updated).await?;
                boosted += 1;
                debug!(
                    member = %member.member,
                    from = %priority,
                    to = %elevated,
                    waited_secs = age.as_secs(),
                    "Elevated starving entry"
                );
            }
        }
        Ok(boosted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn queue(shards: usize) -> PriorityQueue {
        PriorityQueue::new(Arc::new(MemoryQueueBackend::new()), shards)
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_single() {
        let q = queue(4);
        let t = token();
        let id = ItemId::new();

        q.enqueue(&t, id, Priority::NORMAL).await.unwrap();
        assert_eq!(q.len(&t).await.unwrap(), 1);

        let entry = q.dequeue(&t).await.unwrap().unwrap();
        assert_eq!(entry.id, id);
        assert_eq!(entry.priority, Priority::NORMAL);
        assert_eq!(q.len(&t).await.unwrap(), 0);
        assert!(q.dequeue(&t).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_priority_order_across_shards() {
        let q = queue(4);
        let t = token();
        let now = Utc::now();

        let low = ItemId::new();
        let high = ItemId::new();
        let normal = ItemId::new();
        q.enqueue_at(&t, low, Priority::LOW, now).await.unwrap();
        q.enqueue_at(&t, high, Priority::HIGH, now + ChronoDuration::seconds(1))
            .await
            .unwrap();
        q.enqueue_at(&t, normal, Priority::NORMAL, now + ChronoDuration::seconds(2))
            .await
            .unwrap();

        let batch = q.dequeue_batch(&t, 3).await.unwrap();
        let ids: Vec<ItemId> = batch.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![high, normal, low]);
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let q = queue(4);
        let t = token();
        let base = Utc::now();

        let mut expected = Vec::new();
        for i in 0..5 {
            let id = ItemId::new();
            q.enqueue_at(&t, id, Priority::NORMAL, base + ChronoDuration::seconds(i))
                .await
                .unwrap();
            expected.push(id);
        }

        let batch = q.dequeue_batch(&t, 5).await.unwrap();
        let ids: Vec<ItemId> = batch.iter().map(|e| e.id).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_enqueue_idempotent() {
        let q = queue(2);
        let t = token();
        let id = ItemId::new();

        q.enqueue(&t, id, Priority::LOW).await.unwrap();
        q.enqueue(&t, id, Priority::HIGH).await.unwrap();
        assert_eq!(q.len(&t).await.unwrap(), 1);

        let entry = q.dequeue(&t).await.unwrap().unwrap();
        assert_eq!(entry.priority, Priority::HIGH);
    }

    #[tokio::test]
    async fn test_update_priority_preserves_age() {
        let q = queue(4);
        let t = token();
        let base = Utc::now();

        let a = ItemId::new();
        let b = ItemId::new();
        q.enqueue_at(&t, a, Priority::NORMAL, base).await.unwrap();
        q.enqueue_at(&t, b, Priority::NORMAL, base + ChronoDuration::seconds(1))
            .await
            .unwrap();

        q.update_priority(&t, a, Priority::HIGH).await.unwrap();

        let first = q.dequeue(&t).await.unwrap().unwrap();
        assert_eq!(first.id, a);
        assert_eq!(first.priority, Priority::HIGH);
        // The age component survived the rewrite.
        assert_eq!(first.enqueued_at.timestamp(), base.timestamp());
    }

    #[tokio::test]
    async fn test_update_priority_missing() {
        let q = queue(2);
        let t = token();
        let err = q
            .update_priority(&t, ItemId::new(), Priority::HIGH)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NotInQueue(_)));
    }

    #[tokio::test]
    async fn test_remove() {
        let q = queue(2);
        let t = token();
        let id = ItemId::new();

        q.enqueue(&t, id, Priority::NORMAL).await.unwrap();
        q.remove(&t, id).await.unwrap();
        assert_eq!(q.len(&t).await.unwrap(), 0);
        assert!(matches!(
            q.remove(&t, id).await.unwrap_err(),
            QueueError::NotInQueue(_)
        ));
    }

    #[tokio::test]
    async fn test_position_counts_all_shards() {
        let q = queue(4);
        let t = token();
        let base = Utc::now();

        let first = ItemId::new();
        let second = ItemId::new();
        let third = ItemId::new();
        q.enqueue_at(&t, first, Priority::HIGH, base).await.unwrap();
        q.enqueue_at(&t, second, Priority::NORMAL, base).await.unwrap();
        q.enqueue_at(&t, third, Priority::LOW, base).await.unwrap();

        assert_eq!(q.position(&t, first).await.unwrap(), 1);
        assert_eq!(q.position(&t, second).await.unwrap(), 2);
        assert_eq!(q.position(&t, third).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_size_by_priority() {
        let q = queue(4);
        let t = token();

        for _ in 0..3 {
            q.enqueue(&t, ItemId::new(), Priority::LOW).await.unwrap();
        }
        q.enqueue(&t, ItemId::new(), Priority::HIGH).await.unwrap();

        let sizes = q.size_by_priority(&t).await.unwrap();
        assert_eq!(sizes[&Priority::LOW], 3);
        assert_eq!(sizes[&Priority::NORMAL], 0);
        assert_eq!(sizes[&Priority::HIGH], 1);
    }

    #[tokio::test]
    async fn test_peek_does_not_remove() {
        let q = queue(4);
        let t = token();
        q.enqueue(&t, ItemId::new(), Priority::NORMAL).await.unwrap();

        let peeked = q.peek_next(&t, 5).await.unwrap();
        assert_eq!(peeked.len(), 1);
        assert_eq!(q.len(&t).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_boost_starving_elevates_and_preserves_age() {
        let q = queue(4);
        let t = token();
        let base = Utc::now() - ChronoDuration::seconds(700);

        let starving = ItemId::new();
        let fresh = ItemId::new();
        q.enqueue_at(&t, starving, Priority::LOW, base).await.unwrap();
        q.enqueue(&t, fresh, Priority::LOW).await.unwrap();

        // 700s of age with a 100s threshold: 600s overrun = 2 elevation steps.
        let boosted = q
            .boost_starving(&t, Duration::from_secs(100))
            .await
            .unwrap();
        assert_eq!(boosted, 1);

        let entry = q.dequeue(&t).await.unwrap().unwrap();
        assert_eq!(entry.id, starving);
        assert_eq!(entry.priority, Priority::new(3).unwrap());
        assert_eq!(entry.enqueued_at.timestamp(), base.timestamp());
    }

    #[tokio::test]
    async fn test_boost_starving_caps_at_high() {
        let q = queue(2);
        let t = token();
        let ancient = Utc::now() - ChronoDuration::hours(10);
        let id = ItemId::new();
        q.enqueue_at(&t, id, Priority::LOW, ancient).await.unwrap();

        q.boost_starving(&t, Duration::from_secs(1)).await.unwrap();
        let entry = q.dequeue(&t).await.unwrap().unwrap();
        assert_eq!(entry.priority, Priority::HIGH);
    }

    #[tokio::test]
    async fn test_boost_starving_monotonic() {
        let q = queue(2);
        let t = token();
        let base = Utc::now() - ChronoDuration::seconds(400);
        let id = ItemId::new();
        q.enqueue_at(&t, id, Priority::NORMAL, base).await.unwrap();

        q.boost_starving(&t, Duration::from_secs(50)).await.unwrap();
        let after_first = q.peek_next(&t, 1).await.unwrap()[0].priority;

        // A second pass never lowers the effective priority.
        q.boost_starving(&t, Duration::from_secs(50)).await.unwrap();
        let after_second = q.peek_next(&t, 1).await.unwrap()[0].priority;
        assert!(after_second >= after_first);
    }

    #[tokio::test]
    async fn test_boost_skips_within_threshold() {
        let q = queue(2);
        let t = token();
        q.enqueue(&t, ItemId::new(), Priority::LOW).await.unwrap();

        let boosted = q
            .boost_starving(&t, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(boosted, 0);
    }

    #[tokio::test]
    async fn test_cancelled_token_rejected() {
        let q = queue(2);
        let t = token();
        t.cancel();

        assert!(matches!(
            q.enqueue(&t, ItemId::new(), Priority::LOW).await.unwrap_err(),
            QueueError::Cancelled
        ));
        assert!(matches!(
            q.dequeue(&t).await.unwrap_err(),
            QueueError::Cancelled
        ));
    }

    #[tokio::test]
    async fn test_shard_index_stable_and_in_range() {
        let q = queue(8);
        let id = ItemId::new();
        let first = q.shard_index(id);
        assert_eq!(first, q.shard_index(id));
        assert!(first < 8);
    }

    #[tokio::test]
    async fn test_dequeue_batch_more_than_available() {
        let q = queue(4);
        let t = token();
        for _ in 0..3 {
            q.enqueue(&t, ItemId::new(), Priority::NORMAL).await.unwrap();
        }
        let batch = q.dequeue_batch(&t, 10).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(q.len(&t).await.unwrap(), 0);
    }
}
