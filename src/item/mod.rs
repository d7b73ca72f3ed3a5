//! Item domain model.
//!
//! This module defines the core types for a unit of work submitted for
//! priority-ordered processing:
//!
//! - `Item`: the aggregate owned by the item store
//! - `ItemId`: opaque 128-bit identifier
//! - `Priority`: integer priority in [1, 5], 5 is highest
//! - `ItemStatus` / `StatusEvent`: the status state machine
//!
//! Status transitions are modeled as a pure state machine: an event applied
//! to a status either yields the next status or fails with
//! `ItemError::InvalidTransition`. The `Item` methods consult the state
//! machine, stamp the transition timestamps, and increment `version`, so a
//! subsequent save is a plain data operation.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::MemoryItemStore;
pub use postgres::PostgresItemStore;
pub use store::{ItemStore, StoreError};

/// Errors raised by the item domain guards.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ItemError {
    #[error("item title cannot be empty")]
    EmptyTitle,

    #[error("item group cannot be empty")]
    EmptyGroup,

    #[error("item audience cannot be empty")]
    EmptyAudience,

    #[error("priority must be between {min} and {max}, got {value}", min = Priority::MIN, max = Priority::MAX)]
    InvalidPriority { value: i64 },

    #[error("invalid status transition from '{from}' on event '{event}'")]
    InvalidTransition { from: ItemStatus, event: StatusEvent },

    #[error("no transition leads to status '{target}'")]
    InvalidTarget { target: ItemStatus },

    #[error("cannot change priority while status is '{status}'")]
    PriorityLocked { status: ItemStatus },

    #[error("unknown status '{0}'")]
    UnknownStatus(String),
}

/// Opaque identifier for an item, unique across the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(Uuid);

impl ItemId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses an id from its string form.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }

    /// Returns the underlying uuid.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ItemId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Item priority in [1, 5]; 5 is dispatched first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    pub const LOW: Priority = Priority(1);
    pub const NORMAL: Priority = Priority(3);
    pub const HIGH: Priority = Priority(5);

    /// Validates and constructs a priority.
    pub fn new(value: impl Into<i64>) -> Result<Self, ItemError> {
        let value = value.into();
        if (Self::MIN as i64..=Self::MAX as i64).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(ItemError::InvalidPriority { value })
        }
    }

    /// Returns the numeric level.
    pub fn level(&self) -> u8 {
        self.0
    }

    /// Returns this priority raised by `boost` levels, saturating at the
    /// maximum.
    pub fn boosted(&self, boost: u8) -> Priority {
        Priority(self.0.saturating_add(boost).min(Self::MAX))
    }

    /// Iterates every valid priority level, lowest first.
    pub fn all() -> impl Iterator<Item = Priority> {
        (Self::MIN..=Self::MAX).map(Priority)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Waiting in the queue.
    Queued,
    /// Claimed by a worker.
    Processing,
    /// Finished successfully.
    Completed,
    /// Finished with an error, timeout, or cancellation.
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Queued => "queued",
            ItemStatus::Processing => "processing",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ItemError> {
        match s {
            "queued" => Ok(ItemStatus::Queued),
            "processing" => Ok(ItemStatus::Processing),
            "completed" => Ok(ItemStatus::Completed),
            "failed" => Ok(ItemStatus::Failed),
            other => Err(ItemError::UnknownStatus(other.to_string())),
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed)
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Events accepted by the status state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    Start,
    Complete,
    Fail,
}

impl std::fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StatusEvent::Start => "start",
            StatusEvent::Complete => "complete",
            StatusEvent::Fail => "fail",
        };
        write!(f, "{}", s)
    }
}

impl StatusEvent {
    /// Returns the event that would move an item into `target`, if any.
    /// There is no event back to `Queued`.
    pub fn leading_to(target: ItemStatus) -> Option<StatusEvent> {
        match target {
            ItemStatus::Queued => None,
            ItemStatus::Processing => Some(StatusEvent::Start),
            ItemStatus::Completed => Some(StatusEvent::Complete),
            ItemStatus::Failed => Some(StatusEvent::Fail),
        }
    }
}

/// The pure transition function: QUEUED → PROCESSING → {COMPLETED, FAILED}.
///
/// No other edges exist; in particular nothing returns to QUEUED and
/// terminal statuses accept no events.
pub fn transition(from: ItemStatus, event: StatusEvent) -> Result<ItemStatus, ItemError> {
    match (from, event) {
        (ItemStatus::Queued, StatusEvent::Start) => Ok(ItemStatus::Processing),
        (ItemStatus::Processing, StatusEvent::Complete) => Ok(ItemStatus::Completed),
        (ItemStatus::Processing, StatusEvent::Fail) => Ok(ItemStatus::Failed),
        _ => Err(ItemError::InvalidTransition { from, event }),
    }
}

/// A unit of work submitted for priority-ordered processing.
///
/// The item store is the record of truth for this aggregate; the queue holds
/// only the id and a derived ordering score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Unique identifier, assigned at creation.
    pub id: ItemId,
    /// Human-readable title.
    pub title: String,
    /// Group tag used as a selector for bulk operations.
    pub group: String,
    /// Audience tags.
    pub audience: Vec<String>,
    /// Current priority; mutable only while queued.
    pub priority: Priority,
    /// Wait threshold past which the item counts as starving.
    #[serde(with = "duration_secs")]
    pub max_wait: Duration,
    /// Lifecycle status.
    pub status: ItemStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Set when a worker claims the item.
    pub processing_started_at: Option<DateTime<Utc>>,
    /// Set when the item reaches a terminal status.
    pub processed_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency version; increments on every mutation.
    pub version: i64,
}

impl Item {
    /// Creates a new queued item, validating the descriptive fields.
    pub fn new(
        title: impl Into<String>,
        group: impl Into<String>,
        audience: Vec<String>,
        priority: Priority,
        max_wait: Duration,
    ) -> Result<Self, ItemError> {
        let title = title.into();
        let group = group.into();

        if title.is_empty() {
            return Err(ItemError::EmptyTitle);
        }
        if group.is_empty() {
            return Err(ItemError::EmptyGroup);
        }
        if audience.is_empty() {
            return Err(ItemError::EmptyAudience);
        }

        Ok(Self {
            id: ItemId::new(),
            title,
            group,
            audience,
            priority,
            max_wait,
            status: ItemStatus::Queued,
            created_at: Utc::now(),
            processing_started_at: None,
            processed_at: None,
            version: 1,
        })
    }

    /// Marks the item as claimed by a worker.
    pub fn start_processing(&mut self) -> Result<(), ItemError> {
        self.status = transition(self.status, StatusEvent::Start)?;
        self.processing_started_at = Some(Utc::now());
        self.version += 1;
        Ok(())
    }

    /// Marks the item as successfully processed.
    pub fn complete_processing(&mut self) -> Result<(), ItemError> {
        self.status = transition(self.status, StatusEvent::Complete)?;
        self.processed_at = Some(Utc::now());
        self.version += 1;
        Ok(())
    }

    /// Marks the item as failed.
    pub fn fail_processing(&mut self) -> Result<(), ItemError> {
        self.status = transition(self.status, StatusEvent::Fail)?;
        self.processed_at = Some(Utc::now());
        self.version += 1;
        Ok(())
    }

    /// Changes the priority. Only permitted while the item is queued.
    pub fn change_priority(&mut self, new_priority: Priority) -> Result<(), ItemError> {
        if self.status != ItemStatus::Queued {
            return Err(ItemError::PriorityLocked {
                status: self.status,
            });
        }
        self.priority = new_priority;
        self.version += 1;
        Ok(())
    }

    /// How long the item waited before processing started, or has been
    /// waiting so far if it is still queued.
    pub fn wait_time(&self) -> Duration {
        let waited = match self.processing_started_at {
            Some(started) => started - self.created_at,
            None => Utc::now() - self.created_at,
        };
        waited.max(ChronoDuration::zero()).to_std().unwrap_or(Duration::ZERO)
    }

    /// A queued item whose wait time exceeds its threshold is starving.
    pub fn is_starving(&self) -> bool {
        self.status == ItemStatus::Queued && self.wait_time() > self.max_wait
    }
}

/// Serde helper: durations persisted as whole seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(de)?;
        Ok(Duration::from_secs(secs))
    }
}
