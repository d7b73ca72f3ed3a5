//! adqueue: distributed priority queue for asynchronous ad processing.
//!
//! Producers submit items with a declared priority; a pool of workers
//! drains the queue concurrently with FIFO ordering inside each priority
//! level, an anti-starvation daemon eventually elevates long-waiting
//! low-priority items, and a natural-language control surface mutates the
//! live queue in bulk.

pub mod bulk;
pub mod cli;
pub mod command;
pub mod config;
pub mod item;
pub mod metrics;
pub mod queue;
pub mod service;
pub mod worker;

// Re-export the types most callers need.
pub use bulk::{BulkMutator, RewriteOutcome, Selector};
pub use command::{CommandEngine, CommandOutcome};
pub use config::{AppConfig, ConfigStore, QueueSettings};
pub use item::{Item, ItemId, ItemStatus, ItemStore, Priority};
pub use queue::{PriorityQueue, QueueEntry, StarvationDaemon};
pub use service::ItemService;
pub use worker::WorkerPool;
