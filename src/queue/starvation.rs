//! Anti-starvation daemon.
//!
//! A single background task that periodically scans every shard and
//! elevates entries that have waited past the configured threshold, so no
//! item waits indefinitely under sustained high-priority load. The daemon
//! is gated by the live `anti_starvation_enabled` setting and competes with
//! producers, workers, and bulk updates without locks; overlapping writes
//! resolve last-writer-wins and converge on a later pass.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ConfigStore;

use super::{PriorityQueue, QueueError};

/// Default scan period.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(30);

/// Periodic elevation task for starving queue entries.
pub struct StarvationDaemon {
    queue: PriorityQueue,
    config: Arc<ConfigStore>,
    period: Duration,
}

impl StarvationDaemon {
    pub fn new(queue: PriorityQueue, config: Arc<ConfigStore>) -> Self {
        Self {
            queue,
            config,
            period: DEFAULT_PERIOD,
        }
    }

    /// Overrides the scan period (tests use short periods).
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Spawns the daemon task. It runs until `token` is cancelled.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(period_secs = self.period.as_secs(), "Anti-starvation daemon started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(self.period) => {
                        self.pass(&token).await;
                    }
                }
            }
            info!("Anti-starvation daemon stopped");
        })
    }

    /// One scan-and-elevate pass.
    pub async fn pass(&self, token: &CancellationToken) {
        let settings = self.config.current().await;
        if !settings.anti_starvation_enabled {
            debug!("Anti-starvation disabled, skipping pass");
            return;
        }

        match self.queue.boost_starving(token, settings.max_wait).await {
            Ok(0) => debug!("Anti-starvation pass found no starving entries"),
            Ok(boosted) => info!(boosted = boosted, "Anti-starvation pass elevated entries"),
            Err(QueueError::Cancelled) => {}
            Err(e) => error!(error = %e, "Anti-starvation pass failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;
    use crate::item::{ItemId, Priority};
    use crate::queue::MemoryQueueBackend;
    use chrono::{Duration as ChronoDuration, Utc};

    fn fixture(enabled: bool) -> (PriorityQueue, Arc<ConfigStore>) {
        let backend = Arc::new(MemoryQueueBackend::new());
        let queue = PriorityQueue::new(backend.clone(), 4);
        let settings = QueueSettings::default()
            .with_anti_starvation(enabled)
            .with_max_wait(Duration::from_secs(1));
        let config = Arc::new(ConfigStore::new(backend, settings));
        (queue, config)
    }

    #[tokio::test]
    async fn test_pass_elevates_when_enabled() {
        let (queue, config) = fixture(true);
        let token = CancellationToken::new();
        let id = ItemId::new();
        queue
            .enqueue_at(&token, id, Priority::LOW, Utc::now() - ChronoDuration::hours(2))
            .await
            .unwrap();

        let daemon = StarvationDaemon::new(queue.clone(), config);
        daemon.pass(&token).await;

        let entry = queue.peek_next(&token, 1).await.unwrap();
        assert_eq!(entry[0].priority, Priority::HIGH);
    }

    #[tokio::test]
    async fn test_pass_skips_when_disabled() {
        let (queue, config) = fixture(false);
        let token = CancellationToken::new();
        let id = ItemId::new();
        queue
            .enqueue_at(&token, id, Priority::LOW, Utc::now() - ChronoDuration::hours(2))
            .await
            .unwrap();

        let daemon = StarvationDaemon::new(queue.clone(), config);
        daemon.pass(&token).await;

        let entry = queue.peek_next(&token, 1).await.unwrap();
        assert_eq!(entry[0].priority, Priority::LOW);
    }

    #[tokio::test]
    async fn test_spawn_and_cancel() {
        let (queue, config) = fixture(true);
        let token = CancellationToken::new();

        let handle = StarvationDaemon::new(queue, config)
            .with_period(Duration::from_millis(10))
            .spawn(token.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
        handle.await.unwrap();
    }
}
