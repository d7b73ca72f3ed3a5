//! Worker pool for draining the queue.
//!
//! One dispatcher task batch-polls the queue on a fixed cadence and fans
//! entries out to long-lived workers over bounded channels. Each worker
//! drives an item through claim → work → terminal save using the store's
//! optimistic concurrency; failures never crash the pool. Delivery is
//! at-least-once: a worker that cannot record a terminal status after two
//! attempts logs and moves on.
//!
//! Backpressure: when every worker channel is full, the dispatcher returns
//! the overflow entries to the queue with their original enqueue time (so
//! their FIFO age is preserved) and records a saturation event, keeping the
//! dequeue cadence steady instead of blocking on any one batch.

use chrono::Utc;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConfigStore;
use crate::item::{Item, ItemStatus, ItemStore, StoreError};
use crate::metrics::MetricsSink;
use crate::queue::{PriorityQueue, QueueEntry, QueueError};

/// Capacity of each worker's inbound channel.
pub const WORKER_CHANNEL_CAPACITY: usize = 10;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is already running.
    #[error("pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Tunables that are fixed per pool rather than live-configurable.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// How often the dispatcher polls the queue.
    pub dispatch_interval: Duration,
    /// Simulated work duration window (uniform).
    pub work_window: (Duration, Duration),
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            dispatch_interval: Duration::from_millis(100),
            work_window: (Duration::from_secs(2), Duration::from_secs(5)),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

/// Snapshot of pool statistics.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Number of workers in the pool.
    pub num_workers: usize,
    /// Workers currently processing an item.
    pub active_workers: usize,
    /// Items completed successfully.
    pub items_completed: u64,
    /// Items that reached the failed status.
    pub items_failed: u64,
    /// Average per-item processing duration.
    pub average_duration: Duration,
}

impl PoolStats {
    /// Total items that reached a terminal status.
    pub fn total_processed(&self) -> u64 {
        self.items_completed + self.items_failed
    }

    /// Completion rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.items_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedStats {
    completed: AtomicU64,
    failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active: AtomicU64,
}

impl SharedStats {
    fn new() -> Self {
        Self {
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active: AtomicU64::new(0),
        }
    }

    fn record(&self, status: ItemStatus, duration: Duration) {
        match status {
            ItemStatus::Completed => self.completed.fetch_add(1, Ordering::SeqCst),
            _ => self.failed.fetch_add(1, Ordering::SeqCst),
        };
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn enter(&self) -> u64 {
        self.active.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn leave(&self) -> u64 {
        self.active.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }

    fn snapshot(&self, num_workers: usize) -> PoolStats {
        let completed = self.completed.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total = completed + failed;
        let average_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active.load(Ordering::SeqCst) as usize,
            items_completed: completed,
            items_failed: failed,
            average_duration,
        }
    }
}

/// Pool of workers draining the priority queue.
pub struct WorkerPool {
    store: Arc<dyn ItemStore>,
    queue: PriorityQueue,
    config: Arc<ConfigStore>,
    metrics: Arc<dyn MetricsSink>,
    options: PoolOptions,
    stats: Arc<SharedStats>,
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    num_workers: usize,
    running: bool,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn ItemStore>,
        queue: PriorityQueue,
        config: Arc<ConfigStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            queue,
            config,
            metrics,
            options: PoolOptions::default(),
            stats: Arc::new(SharedStats::new()),
            token: CancellationToken::new(),
            handles: Vec::new(),
            num_workers: 0,
            running: false,
        }
    }

    /// Overrides the pool tunables.
    pub fn with_options(mut self, options: PoolOptions) -> Self {
        self.options = options;
        self
    }

    /// Starts the dispatcher and `worker_count` workers, tied to `token`.
    pub async fn start(&mut self, token: CancellationToken) -> Result<(), PoolError> {
        if self.running {
            return Err(PoolError::AlreadyRunning);
        }
        self.token = token;

        // Pick up any settings persisted by a previous process.
        let settings = match self.config.load().await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, "Could not load persisted settings, using current");
                self.config.current().await
            }
        };
        self.num_workers = settings.worker_count;

        let mut senders = Vec::with_capacity(self.num_workers);
        for index in 0..self.num_workers {
            let (tx, rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
            senders.push(tx);

            let worker = Worker {
                id: format!("worker-{}", index),
                store: Arc::clone(&self.store),
                config: Arc::clone(&self.config),
                metrics: Arc::clone(&self.metrics),
                stats: Arc::clone(&self.stats),
                work_window: self.options.work_window,
                token: self.token.clone(),
            };
            self.handles.push(tokio::spawn(worker.run(rx)));
        }

        let dispatcher = Dispatcher {
            queue: self.queue.clone(),
            config: Arc::clone(&self.config),
            metrics: Arc::clone(&self.metrics),
            interval: self.options.dispatch_interval,
            token: self.token.clone(),
            senders,
        };
        self.handles.push(tokio::spawn(dispatcher.run()));

        self.running = true;
        info!(workers = self.num_workers, "Worker pool started");
        Ok(())
    }

    /// Cancels the pool token and waits for every task to finish.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.running {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");
        self.token.cancel();

        let join_all = async {
            for handle in self.handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = match tokio::time::timeout(self.options.shutdown_timeout, join_all).await {
            Ok(()) => Ok(()),
            Err(_) => Err(PoolError::ShutdownTimeout(self.options.shutdown_timeout)),
        };

        self.running = false;
        info!("Worker pool shutdown complete");
        result
    }

    /// Current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot(self.num_workers)
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

/// Dispatcher task: polls the queue and fans entries out to workers.
struct Dispatcher {
    queue: PriorityQueue,
    config: Arc<ConfigStore>,
    metrics: Arc<dyn MetricsSink>,
    interval: Duration,
    token: CancellationToken,
    senders: Vec<mpsc::Sender<QueueEntry>>,
}

impl Dispatcher {
    async fn run(self) {
        info!("Dispatcher started");
        let mut next_worker = 0usize;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let settings = self.config.current().await;
            let batch = match self
                .queue
                .dequeue_batch(&self.token, settings.batch_size)
                .await
            {
                Ok(batch) => batch,
                Err(QueueError::Cancelled) => break,
                Err(e) => {
                    error!(error = %e, "Failed to dequeue batch");
                    continue;
                }
            };

            if batch.is_empty() {
                continue;
            }

            self.metrics.record_dequeued(batch.len());
            debug!(count = batch.len(), "Dequeued batch for processing");

            let overflow = self.distribute(batch, &mut next_worker);
            if !overflow.is_empty() {
                warn!(
                    count = overflow.len(),
                    "All workers busy, returning entries to the queue"
                );
                self.metrics.record_workers_saturated();
                for entry in overflow {
                    if let Err(e) = self
                        .queue
                        .enqueue_at(&self.token, entry.id, entry.priority, entry.enqueued_at)
                        .await
                    {
                        error!(item_id = %entry.id, error = %e, "Failed to return entry to queue");
                    }
                }
            }
        }
        info!("Dispatcher stopped");
    }

    /// Hands entries to workers round-robin without blocking; returns the
    /// entries no worker could accept.
    fn distribute(
        &self,
        batch: Vec<QueueEntry>,
        next_worker: &mut usize,
    ) -> Vec<QueueEntry> {
        let worker_count = self.senders.len();
        let mut overflow = Vec::new();

        'entries: for mut entry in batch {
            for _ in 0..worker_count {
                let index = *next_worker;
                *next_worker = (*next_worker + 1) % worker_count;

                match self.senders[index].try_send(entry) {
                    Ok(()) => continue 'entries,
                    Err(mpsc::error::TrySendError::Full(returned))
                    | Err(mpsc::error::TrySendError::Closed(returned)) => {
                        entry = returned;
                    }
                }
            }
            overflow.push(entry);
        }
        overflow
    }
}

enum WorkOutcome {
    Completed,
    TimedOut,
    Cancelled,
}

/// A single worker task.
struct Worker {
    id: String,
    store: Arc<dyn ItemStore>,
    config: Arc<ConfigStore>,
    metrics: Arc<dyn MetricsSink>,
    stats: Arc<SharedStats>,
    work_window: (Duration, Duration),
    token: CancellationToken,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<QueueEntry>) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                received = rx.recv() => match received {
                    Some(entry) => self.process(entry).await,
                    None => break,
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn process(&self, entry: QueueEntry) {
        let started = Instant::now();
        debug!(
            worker_id = %self.id,
            item_id = %entry.id,
            priority = %entry.priority,
            "Processing item"
        );

        let active = self.stats.enter();
        self.metrics.update_active_workers(active as usize);

        let terminal = self.handle_entry(entry).await;

        let active = self.stats.leave();
        self.metrics.update_active_workers(active as usize);

        if let Some(status) = terminal {
            let duration = started.elapsed();
            self.stats.record(status, duration);
            self.metrics
                .record_processed(status.as_str(), duration.as_secs_f64());
            info!(
                worker_id = %self.id,
                status = %status,
                duration_ms = duration.as_millis(),
                "Item processing finished"
            );
        }
    }

    /// Claim → work → terminal save. Returns the terminal status applied,
    /// or `None` when the entry was discarded.
    async fn handle_entry(&self, entry: QueueEntry) -> Option<ItemStatus> {
        let mut item = match self.store.find(entry.id).await {
            Ok(item) => item,
            Err(StoreError::NotFound(_)) => {
                warn!(worker_id = %self.id, item_id = %entry.id, "Stale queue entry, discarding");
                return None;
            }
            Err(e) => {
                error!(worker_id = %self.id, item_id = %entry.id, error = %e, "Failed to load item");
                return None;
            }
        };

        if !self.claim(&mut item).await {
            return None;
        }

        let outcome = self.execute_work(&item).await;
        let desired = match outcome {
            WorkOutcome::Completed => ItemStatus::Completed,
            WorkOutcome::TimedOut => {
                warn!(worker_id = %self.id, item_id = %item.id, "Item processing timed out");
                ItemStatus::Failed
            }
            WorkOutcome::Cancelled => {
                warn!(worker_id = %self.id, item_id = %item.id, "Item processing cancelled");
                ItemStatus::Failed
            }
        };

        self.finish(item, desired).await
    }

    /// Moves the item into PROCESSING, retrying once through a reload on an
    /// optimistic-lock conflict.
    async fn claim(&self, item: &mut Item) -> bool {
        for attempt in 0..2 {
            if let Err(e) = item.start_processing() {
                debug!(
                    worker_id = %self.id,
                    item_id = %item.id,
                    error = %e,
                    "Entry not claimable, discarding"
                );
                return false;
            }

            match self.store.save(item).await {
                Ok(()) => return true,
                Err(StoreError::OptimisticLock(_)) if attempt == 0 => {
                    match self.store.find(item.id).await {
                        Ok(fresh) if fresh.status == ItemStatus::Queued => *item = fresh,
                        Ok(fresh) => {
                            debug!(
                                worker_id = %self.id,
                                item_id = %item.id,
                                status = %fresh.status,
                                "Item claimed elsewhere, discarding"
                            );
                            return false;
                        }
                        Err(e) => {
                            warn!(worker_id = %self.id, item_id = %item.id, error = %e, "Reload failed");
                            return false;
                        }
                    }
                }
                Err(e) => {
                    warn!(worker_id = %self.id, item_id = %item.id, error = %e, "Claim save failed");
                    return false;
                }
            }
        }
        false
    }

    /// The simulated external work: a uniformly random sleep inside the
    /// configured window, bounded by the processing timeout and aborted by
    /// cancellation.
    async fn execute_work(&self, _item: &Item) -> WorkOutcome {
        let settings = self.config.current().await;
        let (min, max) = self.work_window;
        let work_ms = {
            let mut rng = rand::thread_rng();
            rng.gen_range(min.as_millis() as u64..=max.as_millis() as u64)
        };
        let work = tokio::time::sleep(Duration::from_millis(work_ms));

        tokio::select! {
            _ = self.token.cancelled() => WorkOutcome::Cancelled,
            result = tokio::time::timeout(settings.processing_timeout, work) => match result {
                Ok(()) => WorkOutcome::Completed,
                Err(_) => WorkOutcome::TimedOut,
            }
        }
    }

    /// Applies the terminal status. A conflicting save means the item was
    /// mutated externally while the work ran; the terminal intent wins, so
    /// the second attempt reloads and forces the status onto the fresh
    /// version. Two failed attempts are logged and abandoned.
    async fn finish(&self, mut item: Item, desired: ItemStatus) -> Option<ItemStatus> {
        let applied = match desired {
            ItemStatus::Completed => item.complete_processing(),
            _ => item.fail_processing(),
        };

        match applied {
            Ok(()) => match self.store.save(&item).await {
                Ok(()) => return Some(desired),
                Err(StoreError::OptimisticLock(_)) => {
                    warn!(
                        worker_id = %self.id,
                        item_id = %item.id,
                        "Terminal save conflicted with an external mutation"
                    );
                }
                Err(e) => {
                    warn!(worker_id = %self.id, item_id = %item.id, error = %e, "Terminal save failed");
                    return None;
                }
            },
            Err(e) => {
                warn!(
                    worker_id = %self.id,
                    item_id = %item.id,
                    error = %e,
                    "Item status changed externally during processing"
                );
            }
        }

        let mut fresh = match self.store.find(item.id).await {
            Ok(fresh) => fresh,
            Err(e) => {
                error!(worker_id = %self.id, item_id = %item.id, error = %e, "Reload for terminal save failed");
                return None;
            }
        };

        if fresh.status == desired {
            return Some(desired);
        }

        fresh.status = desired;
        if fresh.processing_started_at.is_none() {
            fresh.processing_started_at = Some(Utc::now());
        }
        if fresh.processed_at.is_none() {
            fresh.processed_at = Some(Utc::now());
        }
        fresh.version += 1;

        match self.store.save(&fresh).await {
            Ok(()) => Some(desired),
            Err(e) => {
                error!(
                    worker_id = %self.id,
                    item_id = %item.id,
                    error = %e,
                    "Abandoning terminal save after two attempts"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;
    use crate::item::{ItemId, MemoryItemStore, Priority};
    use crate::metrics::{MetricEvent, NullSink, RecordingSink};
    use crate::queue::MemoryQueueBackend;

    struct Fixture {
        store: Arc<MemoryItemStore>,
        queue: PriorityQueue,
        config: Arc<ConfigStore>,
        metrics: Arc<RecordingSink>,
    }

    fn fixture(settings: QueueSettings) -> Fixture {
        let backend = Arc::new(MemoryQueueBackend::new());
        Fixture {
            store: Arc::new(MemoryItemStore::new()),
            queue: PriorityQueue::new(backend.clone(), settings.shard_count),
            config: Arc::new(ConfigStore::new(backend, settings)),
            metrics: Arc::new(RecordingSink::new()),
        }
    }

    fn fast_options() -> PoolOptions {
        PoolOptions {
            dispatch_interval: Duration::from_millis(10),
            work_window: (Duration::from_millis(5), Duration::from_millis(10)),
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    async fn seed_item(fixture: &Fixture, priority: Priority) -> Item {
        let item = Item::new(
            "creative",
            "racing",
            vec!["all".to_string()],
            priority,
            Duration::from_secs(300),
        )
        .unwrap();
        fixture.store.save(&item).await.unwrap();
        fixture
            .queue
            .enqueue(&CancellationToken::new(), item.id, priority)
            .await
            .unwrap();
        item
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            active_workers: 2,
            items_completed: 80,
            items_failed: 20,
            average_duration: Duration::from_secs(3),
        };
        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);

        let empty = PoolStats::default();
        assert_eq!(empty.total_processed(), 0);
        assert!((empty.success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_stats() {
        let stats = SharedStats::new();
        stats.record(ItemStatus::Completed, Duration::from_millis(10));
        stats.record(ItemStatus::Completed, Duration::from_millis(20));
        stats.record(ItemStatus::Failed, Duration::from_millis(30));

        assert_eq!(stats.enter(), 1);
        let snapshot = stats.snapshot(2);
        assert_eq!(snapshot.items_completed, 2);
        assert_eq!(snapshot.items_failed, 1);
        assert_eq!(snapshot.active_workers, 1);
        assert_eq!(snapshot.average_duration, Duration::from_millis(20));
        assert_eq!(stats.leave(), 0);
    }

    #[tokio::test]
    async fn test_pool_processes_items_to_completion() {
        let settings = QueueSettings::default()
            .with_worker_count(2)
            .with_batch_size(5);
        let f = fixture(settings);

        let mut seeded = Vec::new();
        for _ in 0..4 {
            seeded.push(seed_item(&f, Priority::NORMAL).await);
        }

        let mut pool = WorkerPool::new(
            f.store.clone(),
            f.queue.clone(),
            f.config.clone(),
            f.metrics.clone(),
        )
        .with_options(fast_options());

        let token = CancellationToken::new();
        pool.start(token.clone()).await.unwrap();

        // Give the pool a few dispatch cycles to drain everything.
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if pool.stats().total_processed() == 4 {
                break;
            }
        }

        token.cancel();
        pool.shutdown().await.unwrap();

        for item in seeded {
            let stored = f.store.find(item.id).await.unwrap();
            assert_eq!(stored.status, ItemStatus::Completed);
            assert!(stored.processing_started_at.is_some());
            assert!(stored.processed_at.is_some());
        }

        let stats = pool.stats();
        assert_eq!(stats.items_completed, 4);
        assert_eq!(stats.items_failed, 0);

        let queue_len = f.queue.len(&CancellationToken::new()).await.unwrap();
        assert_eq!(queue_len, 0);
    }

    #[tokio::test]
    async fn test_pool_discards_stale_entries() {
        let settings = QueueSettings::default().with_worker_count(1);
        let f = fixture(settings);

        // Entry with no store record.
        f.queue
            .enqueue(&CancellationToken::new(), ItemId::new(), Priority::HIGH)
            .await
            .unwrap();
        // Entry whose item already finished processing.
        let mut done = seed_item(&f, Priority::NORMAL).await;
        done.start_processing().unwrap();
        done.complete_processing().unwrap();
        f.store.save(&done).await.unwrap();

        let mut pool = WorkerPool::new(
            f.store.clone(),
            f.queue.clone(),
            f.config.clone(),
            f.metrics.clone(),
        )
        .with_options(fast_options());

        let token = CancellationToken::new();
        pool.start(token.clone()).await.unwrap();

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if f.queue.len(&CancellationToken::new()).await.unwrap() == 0 {
                break;
            }
        }

        token.cancel();
        pool.shutdown().await.unwrap();

        // Both entries were drained and discarded without any processing.
        assert_eq!(pool.stats().total_processed(), 0);
        let stored = f.store.find(done.id).await.unwrap();
        assert_eq!(stored.status, ItemStatus::Completed);
        assert_eq!(stored.version, done.version);
    }

    #[tokio::test]
    async fn test_cancellation_fails_in_flight_item() {
        let settings = QueueSettings::default().with_worker_count(1);
        let f = fixture(settings);
        let item = seed_item(&f, Priority::NORMAL).await;

        let options = PoolOptions {
            dispatch_interval: Duration::from_millis(10),
            // Longer than the test runs, so cancellation hits mid-work.
            work_window: (Duration::from_secs(30), Duration::from_secs(30)),
            shutdown_timeout: Duration::from_secs(5),
        };

        let mut pool = WorkerPool::new(
            f.store.clone(),
            f.queue.clone(),
            f.config.clone(),
            f.metrics.clone(),
        )
        .with_options(options);

        let token = CancellationToken::new();
        pool.start(token.clone()).await.unwrap();

        // Wait for the worker to claim the item.
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let stored = f.store.find(item.id).await.unwrap();
            if stored.status == ItemStatus::Processing {
                break;
            }
        }

        token.cancel();
        pool.shutdown().await.unwrap();

        let stored = f.store.find(item.id).await.unwrap();
        assert_eq!(stored.status, ItemStatus::Failed);
        assert!(stored.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_processing_timeout_fails_item() {
        let settings = QueueSettings::default()
            .with_worker_count(1)
            .with_processing_timeout(Duration::from_millis(20));
        let f = fixture(settings);
        let item = seed_item(&f, Priority::NORMAL).await;

        let options = PoolOptions {
            dispatch_interval: Duration::from_millis(10),
            work_window: (Duration::from_secs(10), Duration::from_secs(10)),
            shutdown_timeout: Duration::from_secs(5),
        };

        let mut pool = WorkerPool::new(
            f.store.clone(),
            f.queue.clone(),
            f.config.clone(),
            f.metrics.clone(),
        )
        .with_options(options);

        let token = CancellationToken::new();
        pool.start(token.clone()).await.unwrap();

        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let stored = f.store.find(item.id).await.unwrap();
            if stored.status.is_terminal() {
                break;
            }
        }

        token.cancel();
        pool.shutdown().await.unwrap();

        let stored = f.store.find(item.id).await.unwrap();
        assert_eq!(stored.status, ItemStatus::Failed);
        assert_eq!(pool.stats().items_failed, 1);
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let f = fixture(QueueSettings::default().with_worker_count(1));
        let mut pool = WorkerPool::new(
            f.store.clone(),
            f.queue.clone(),
            f.config.clone(),
            Arc::new(NullSink),
        )
        .with_options(fast_options());

        let token = CancellationToken::new();
        pool.start(token.clone()).await.unwrap();
        assert!(matches!(
            pool.start(token.clone()).await.unwrap_err(),
            PoolError::AlreadyRunning
        ));

        token.cancel();
        pool.shutdown().await.unwrap();
        assert!(matches!(
            pool.shutdown().await.unwrap_err(),
            PoolError::NotRunning
        ));
    }

    #[tokio::test]
    async fn test_metrics_recorded() {
        let f = fixture(QueueSettings::default().with_worker_count(1));
        seed_item(&f, Priority::HIGH).await;

        let mut pool = WorkerPool::new(
            f.store.clone(),
            f.queue.clone(),
            f.config.clone(),
            f.metrics.clone(),
        )
        .with_options(fast_options());

        let token = CancellationToken::new();
        pool.start(token.clone()).await.unwrap();

        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if pool.stats().total_processed() == 1 {
                break;
            }
        }

        token.cancel();
        pool.shutdown().await.unwrap();

        let events = f.metrics.events();
        assert!(events.iter().any(|e| matches!(e, MetricEvent::Dequeued { .. })));
        assert!(events.iter().any(
            |e| matches!(e, MetricEvent::Processed { status, .. } if status == "completed")
        ));
    }
}
