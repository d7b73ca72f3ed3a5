//! Prometheus metrics registration and export.
//!
//! Defines the Prometheus metrics for queue operation and provides the
//! [`PrometheusSink`] implementation of the metrics capability. Metric
//! instances live behind `OnceLock` statics; `init_metrics` is idempotent.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

use super::MetricsSink;

/// Global Prometheus registry for all adqueue metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total items enqueued, labeled by priority.
pub static ITEMS_ENQUEUED: OnceLock<CounterVec> = OnceLock::new();

/// Total entries pulled off the queue by the dispatcher.
pub static ITEMS_DEQUEUED: OnceLock<Counter> = OnceLock::new();

/// Total items processed, labeled by terminal status.
pub static ITEMS_PROCESSED: OnceLock<CounterVec> = OnceLock::new();

/// Item processing duration in seconds.
pub static PROCESS_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Dispatcher ticks on which every worker channel was full.
pub static WORKERS_SATURATED: OnceLock<Counter> = OnceLock::new();

/// Total entries elevated by the anti-starvation daemon.
pub static STARVATION_BOOSTS: OnceLock<Counter> = OnceLock::new();

/// Total operator commands, labeled by intent and outcome.
pub static COMMANDS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Current total queue depth.
pub static QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Workers currently processing an item.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at application startup; repeat calls are no-ops.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let items_enqueued = CounterVec::new(
        Opts::new("adqueue_items_enqueued_total", "Total items enqueued"),
        &["priority"],
    )?;

    let items_dequeued = Counter::new(
        "adqueue_items_dequeued_total",
        "Total entries pulled off the queue",
    )?;

    let items_processed = CounterVec::new(
        Opts::new("adqueue_items_processed_total", "Total items processed"),
        &["status"],
    )?;

    let process_duration = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "adqueue_process_duration_seconds",
            "Item processing duration in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 3.0, 5.0, 10.0, 30.0, 60.0]),
    )?;

    let workers_saturated = Counter::new(
        "adqueue_workers_saturated_total",
        "Dispatcher ticks with every worker channel full",
    )?;

    let starvation_boosts = Counter::new(
        "adqueue_starvation_boosts_total",
        "Entries elevated by the anti-starvation daemon",
    )?;

    let commands_total = CounterVec::new(
        Opts::new("adqueue_commands_total", "Total operator commands"),
        &["intent", "status"],
    )?;

    let queue_depth = Gauge::new("adqueue_queue_depth", "Current total queue depth")?;

    let active_workers = Gauge::new(
        "adqueue_active_workers",
        "Workers currently processing an item",
    )?;

    registry.register(Box::new(items_enqueued.clone()))?;
    registry.register(Box::new(items_dequeued.clone()))?;
    registry.register(Box::new(items_processed.clone()))?;
    registry.register(Box::new(process_duration.clone()))?;
    registry.register(Box::new(workers_saturated.clone()))?;
    registry.register(Box::new(starvation_boosts.clone()))?;
    registry.register(Box::new(commands_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent).
    let _ = REGISTRY.set(registry);
    let _ = ITEMS_ENQUEUED.set(items_enqueued);
    let _ = ITEMS_DEQUEUED.set(items_dequeued);
    let _ = ITEMS_PROCESSED.set(items_processed);
    let _ = PROCESS_DURATION.set(process_duration);
    let _ = WORKERS_SATURATED.set(workers_saturated);
    let _ = STARVATION_BOOSTS.set(starvation_boosts);
    let _ = COMMANDS_TOTAL.set(commands_total);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized");
    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }
    String::from_utf8(buffer).unwrap_or_else(|_| "# Invalid UTF-8 in metrics\n".to_string())
}

/// Prometheus-backed implementation of [`MetricsSink`].
///
/// Recording methods are safe to call before `init_metrics`; they simply
/// do nothing until the registry exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusSink;

impl PrometheusSink {
    pub fn new() -> Self {
        Self
    }
}

impl MetricsSink for PrometheusSink {
    fn record_enqueued(&self, priority: u8) {
        if let Some(counter) = ITEMS_ENQUEUED.get() {
            counter
                .with_label_values(&[&priority.to_string()])
                .inc();
        }
    }

    fn record_dequeued(&self, count: usize) {
        if let Some(counter) = ITEMS_DEQUEUED.get() {
            counter.inc_by(count as f64);
        }
    }

    fn record_processed(&self, status: &str, duration_secs: f64) {
        if let Some(counter) = ITEMS_PROCESSED.get() {
            counter.with_label_values(&[status]).inc();
        }
        if let Some(histogram) = PROCESS_DURATION.get() {
            histogram.observe(duration_secs);
        }
        tracing::trace!(
            status = status,
            duration_secs = duration_secs,
            "Recorded processed item"
        );
    }

    fn record_workers_saturated(&self) {
        if let Some(counter) = WORKERS_SATURATED.get() {
            counter.inc();
        }
    }

    fn record_starvation_boost(&self, count: u64) {
        if let Some(counter) = STARVATION_BOOSTS.get() {
            counter.inc_by(count as f64);
        }
    }

    fn record_command(&self, intent: &str, status: &str) {
        if let Some(counter) = COMMANDS_TOTAL.get() {
            counter.with_label_values(&[intent, status]).inc();
        }
    }

    fn update_queue_depth(&self, depth: u64) {
        if let Some(gauge) = QUEUE_DEPTH.get() {
            gauge.set(depth as f64);
        }
    }

    fn update_active_workers(&self, count: usize) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.set(count as f64);
        }
    }
}
