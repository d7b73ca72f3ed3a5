//! Bulk priority rewrites.
//!
//! Rewrites the priority of every item matching a selector across both the
//! store and the queue. The store update runs first and is atomic; the
//! queue updates follow best-effort, one per id, with failures counted
//! rather than aborting the batch. Between the two steps the store and the
//! queue briefly disagree; dispatch order follows the queue, item state
//! follows the store, and the anti-starvation daemon converges any drift on
//! a later pass.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::item::{ItemStatus, ItemStore, Priority, StoreError};
use crate::queue::{PriorityQueue, QueueError};

/// Errors that abort a bulk rewrite. Per-id queue failures do not abort;
/// they are counted in the outcome.
#[derive(Debug, Error)]
pub enum BulkError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("bulk rewrite cancelled")]
    Cancelled,
}

/// Which items a rewrite applies to. Both selectors are restricted to
/// queued items.
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    /// Every queued item in the group.
    ByGroup(String),
    /// Every queued item older than the given age.
    ByAge(Duration),
}

/// Result of a bulk rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewriteOutcome {
    /// Rows updated in the store.
    pub affected: u64,
    /// Queue-side updates that failed (entry missing, backend error).
    pub queue_update_failures: u64,
}

/// Coordinates priority rewrites across the store and the queue.
#[derive(Clone)]
pub struct BulkMutator {
    store: Arc<dyn ItemStore>,
    queue: PriorityQueue,
}

impl BulkMutator {
    pub fn new(store: Arc<dyn ItemStore>, queue: PriorityQueue) -> Self {
        Self { store, queue }
    }

    /// Rewrites the priority of every queued item matched by `selector`.
    pub async fn rewrite(
        &self,
        token: &CancellationToken,
        selector: Selector,
        new_priority: Priority,
    ) -> Result<RewriteOutcome, BulkError> {
        if token.is_cancelled() {
            return Err(BulkError::Cancelled);
        }

        let candidates = match &selector {
            Selector::ByGroup(group) => self.store.find_by_group(group).await?,
            Selector::ByAge(age) => {
                let threshold = Utc::now()
                    - chrono::Duration::from_std(*age).unwrap_or(chrono::Duration::zero());
                self.store.find_older_than(threshold).await?
            }
        };

        let ids: Vec<_> = candidates
            .iter()
            .filter(|item| item.status == ItemStatus::Queued)
            .map(|item| item.id)
            .collect();

        if ids.is_empty() {
            return Ok(RewriteOutcome {
                affected: 0,
                queue_update_failures: 0,
            });
        }

        let affected = self
            .store
            .update_priority_batch(&ids, new_priority)
            .await?;

        let mut failures = 0u64;
        for id in &ids {
            match self.queue.update_priority(token, *id, new_priority).await {
                Ok(()) => {}
                Err(QueueError::Cancelled) => return Err(BulkError::Cancelled),
                Err(e) => {
                    warn!(item_id = %id, error = %e, "Queue priority update failed");
                    failures += 1;
                }
            }
        }

        info!(
            selector = ?selector,
            priority = %new_priority,
            affected = affected,
            queue_update_failures = failures,
            "Bulk priority rewrite applied"
        );

        Ok(RewriteOutcome {
            affected,
            queue_update_failures: failures,
        })
    }
}
