//! Application service for item intake and queue queries.
//!
//! The operations an HTTP surface would call: submit an item (persist then
//! index), read an item's status with its live queue position, and the
//! read-only queue queries the command engine reuses.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::item::{Item, ItemError, ItemId, ItemStatus, ItemStore, Priority, StoreError};
use crate::metrics::MetricsSink;
use crate::queue::{PriorityQueue, QueueEntry, QueueError};

/// Rough per-position processing estimate used for the submit response.
const PER_POSITION_ESTIMATE: Duration = Duration::from_secs(3);

/// Default wait threshold for items that do not declare one.
const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(300);

/// Errors surfaced by the item service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Item(#[from] ItemError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Request to submit a new item.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub title: String,
    pub group: String,
    pub audience: Vec<String>,
    /// Defaults to NORMAL when absent.
    pub priority: Option<i64>,
    /// Defaults to 300 seconds when absent.
    pub max_wait_seconds: Option<u64>,
}

/// Response for a submitted item.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitResponse {
    pub id: ItemId,
    pub status: ItemStatus,
    pub priority: Priority,
    /// 1-indexed queue position; absent when the position lookup failed.
    pub position: Option<u64>,
    pub estimated_process_time: DateTime<Utc>,
}

/// Full status view of an item.
#[derive(Debug, Clone, Serialize)]
pub struct ItemStatusView {
    pub id: ItemId,
    pub title: String,
    pub group: String,
    pub status: ItemStatus,
    pub priority: Priority,
    /// Present only while the item is queued.
    pub position: Option<u64>,
    pub wait_time_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Aggregate queue statistics.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub total: u64,
    pub distribution: BTreeMap<Priority, u64>,
}

/// Coordinates the item store and the priority queue for producer-facing
/// operations.
#[derive(Clone)]
pub struct ItemService {
    store: Arc<dyn ItemStore>,
    queue: PriorityQueue,
    metrics: Arc<dyn MetricsSink>,
}

impl ItemService {
    pub fn new(
        store: Arc<dyn ItemStore>,
        queue: PriorityQueue,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            queue,
            metrics,
        }
    }

    /// Creates an item, persists it, and indexes it in the queue.
    pub async fn submit(
        &self,
        token: &CancellationToken,
        request: SubmitRequest,
    ) -> Result<SubmitResponse, ServiceError> {
        let priority = match request.priority {
            Some(value) => Priority::new(value)?,
            None => Priority::NORMAL,
        };
        let max_wait = request
            .max_wait_seconds
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_MAX_WAIT);

        let item = Item::new(
            request.title,
            request.group,
            request.audience,
            priority,
            max_wait,
        )?;

        self.store.save(&item).await?;
        self.queue.enqueue(token, item.id, item.priority).await?;
        self.metrics.record_enqueued(priority.level());

        // Position is best-effort; losing the lookup does not fail the
        // submit.
        let position = match self.queue.position(token, item.id).await {
            Ok(position) => Some(position),
            Err(QueueError::Cancelled) => return Err(QueueError::Cancelled.into()),
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "Queue position lookup failed");
                None
            }
        };

        let ahead = position.unwrap_or(1);
        let estimated_process_time =
            Utc::now() + chrono::Duration::seconds((ahead * PER_POSITION_ESTIMATE.as_secs()) as i64);

        debug!(item_id = %item.id, priority = %priority, position = ?position, "Item submitted");

        Ok(SubmitResponse {
            id: item.id,
            status: item.status,
            priority: item.priority,
            position,
            estimated_process_time,
        })
    }

    /// Returns the full status view for an item, including its queue
    /// position while it is still queued.
    pub async fn item_status(
        &self,
        token: &CancellationToken,
        id: ItemId,
    ) -> Result<ItemStatusView, ServiceError> {
        let item = self.store.find(id).await?;

        let position = if item.status == ItemStatus::Queued {
            self.queue.position(token, id).await.ok()
        } else {
            None
        };

        Ok(ItemStatusView {
            id: item.id,
            title: item.title.clone(),
            group: item.group.clone(),
            status: item.status,
            priority: item.priority,
            position,
            wait_time_seconds: item.wait_time().as_secs(),
            created_at: item.created_at,
            processed_at: item.processed_at,
        })
    }

    /// Total queue size plus the per-priority distribution.
    pub async fn queue_stats(&self, token: &CancellationToken) -> Result<QueueStats, ServiceError> {
        let total = self.queue.len(token).await?;
        let distribution = self.queue.size_by_priority(token).await?;
        self.metrics.update_queue_depth(total);
        Ok(QueueStats {
            total,
            distribution,
        })
    }

    /// The next `count` entries in dispatch order, non-destructive.
    pub async fn next_items(
        &self,
        token: &CancellationToken,
        count: usize,
    ) -> Result<Vec<QueueEntry>, ServiceError> {
        Ok(self.queue.peek_next(token, count).await?)
    }

    /// Items that have been in the system longer than `min_wait`.
    pub async fn waiting_items(
        &self,
        _token: &CancellationToken,
        min_wait: Duration,
    ) -> Result<Vec<Item>, ServiceError> {
        let threshold =
            Utc::now() - chrono::Duration::from_std(min_wait).unwrap_or(chrono::Duration::zero());
        Ok(self.store.find_older_than(threshold).await?)
    }
}
