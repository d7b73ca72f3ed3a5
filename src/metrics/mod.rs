//! Operational metrics.
//!
//! Hot paths record through the [`MetricsSink`] capability rather than a
//! global registry, so tests can substitute a recorder and wiring without
//! metrics uses [`NullSink`]. The production implementation is
//! [`PrometheusSink`] in the `prometheus` submodule.

use std::sync::Mutex;

pub mod prometheus;

pub use prometheus::{export_metrics, init_metrics, PrometheusSink};

/// Sink for operational counters and gauges.
pub trait MetricsSink: Send + Sync {
    /// An item entered the queue.
    fn record_enqueued(&self, priority: u8);

    /// A dispatcher tick pulled `count` entries off the queue.
    fn record_dequeued(&self, count: usize);

    /// A worker finished an item with the given terminal status.
    fn record_processed(&self, status: &str, duration_secs: f64);

    /// Every worker channel was full; overflow entries were returned to the
    /// queue.
    fn record_workers_saturated(&self);

    /// An anti-starvation pass elevated `count` entries.
    fn record_starvation_boost(&self, count: u64);

    /// A command finished with the given status.
    fn record_command(&self, intent: &str, status: &str);

    /// Current total queue depth.
    fn update_queue_depth(&self, depth: u64);

    /// Number of workers currently processing an item.
    fn update_active_workers(&self, count: usize);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn record_enqueued(&self, _priority: u8) {}
    fn record_dequeued(&self, _count: usize) {}
    fn record_processed(&self, _status: &str, _duration_secs: f64) {}
    fn record_workers_saturated(&self) {}
    fn record_starvation_boost(&self, _count: u64) {}
    fn record_command(&self, _intent: &str, _status: &str) {}
    fn update_queue_depth(&self, _depth: u64) {}
    fn update_active_workers(&self, _count: usize) {}
}

/// One recorded metric event, for test assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    Enqueued { priority: u8 },
    Dequeued { count: usize },
    Processed { status: String, duration_secs: f64 },
    WorkersSaturated,
    StarvationBoost { count: u64 },
    Command { intent: String, status: String },
    QueueDepth { depth: u64 },
    ActiveWorkers { count: usize },
}

/// Sink that records every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<MetricEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().expect("metrics lock poisoned").clone()
    }

    fn push(&self, event: MetricEvent) {
        self.events.lock().expect("metrics lock poisoned").push(event);
    }
}

impl MetricsSink for RecordingSink {
    fn record_enqueued(&self, priority: u8) {
        self.push(MetricEvent::Enqueued { priority });
    }

    fn record_dequeued(&self, count: usize) {
        self.push(MetricEvent::Dequeued { count });
    }

    fn record_processed(&self, status: &str, duration_secs: f64) {
        self.push(MetricEvent::Processed {
            status: status.to_string(),
            duration_secs,
        });
    }

    fn record_workers_saturated(&self) {
        self.push(MetricEvent::WorkersSaturated);
    }

    fn record_starvation_boost(&self, count: u64) {
        self.push(MetricEvent::StarvationBoost { count });
    }

    fn record_command(&self, intent: &str, status: &str) {
        self.push(MetricEvent::Command {
            intent: intent.to_string(),
            status: status.to_string(),
        });
    }

    fn update_queue_depth(&self, depth: u64) {
        self.push(MetricEvent::QueueDepth { depth });
    }

    fn update_active_workers(&self, count: usize) {
        self.push(MetricEvent::ActiveWorkers { count });
    }
}
