//! Record-of-truth interface for items.
//!
//! The store owns the durable record for every item; the priority queue
//! holds only ids and scores. Mutations go through conditional-version
//! updates: a save on the update path succeeds only when the stored row is
//! exactly one version behind the incoming record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::{Item, ItemError, ItemId, ItemStatus, Priority};

/// Errors returned by item-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record with the given id.
    #[error("item {0} not found")]
    NotFound(ItemId),

    /// The stored version did not match the caller's expectation. The
    /// caller must reload and retry; this error is not retriable as-is.
    #[error("optimistic lock failed for item {0}: concurrent modification")]
    OptimisticLock(ItemId),

    /// A domain guard rejected the mutation.
    #[error(transparent)]
    InvalidState(#[from] ItemError),

    /// The backend failed; transient, the caller decides whether to retry.
    #[error("storage error: {0}")]
    Storage(String),

    /// Persisted data could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable record-of-truth for items.
///
/// `save` is an upsert: inserts have no precondition, updates require the
/// stored version to equal `item.version - 1`. Commits are atomic per item;
/// `update_priority_batch` is all-or-nothing within the backend transaction.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Upserts an item. Fails with `OptimisticLock` when the stored row's
    /// version is not `item.version - 1`.
    async fn save(&self, item: &Item) -> Result<(), StoreError>;

    /// Loads an item by id.
    async fn find(&self, id: ItemId) -> Result<Item, StoreError>;

    /// All items in a group, ordered by creation time ascending.
    async fn find_by_group(&self, group: &str) -> Result<Vec<Item>, StoreError>;

    /// All items with the given status, ordered by creation time ascending.
    async fn find_by_status(&self, status: ItemStatus) -> Result<Vec<Item>, StoreError>;

    /// All items created before `threshold`, ordered by creation time
    /// ascending.
    async fn find_older_than(&self, threshold: DateTime<Utc>) -> Result<Vec<Item>, StoreError>;

    /// Sets the priority for every listed item that is still queued,
    /// incrementing each affected row's version. Atomic over the set.
    /// Returns the number of rows updated.
    async fn update_priority_batch(
        &self,
        ids: &[ItemId],
        new_priority: Priority,
    ) -> Result<u64, StoreError>;

    /// Conditionally moves an item to `status`. The stored version must
    /// equal `expected_version` and the transition must be legal per the
    /// status state machine.
    async fn update_status(
        &self,
        id: ItemId,
        status: ItemStatus,
        expected_version: i64,
    ) -> Result<(), StoreError>;

    /// Removes an item. Fails with `NotFound` when absent.
    async fn delete(&self, id: ItemId) -> Result<(), StoreError>;

    /// Total number of items.
    async fn count(&self) -> Result<u64, StoreError>;

    /// Number of items with the given status.
    async fn count_by_status(&self, status: ItemStatus) -> Result<u64, StoreError>;

    /// Number of items with the given priority.
    async fn count_by_priority(&self, priority: Priority) -> Result<u64, StoreError>;
}
