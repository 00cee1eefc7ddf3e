//! Prometheus metrics registration and export.
//!
//! All faas metrics live in one process-wide registry. Recording before
//! [`init_metrics`] is a no-op.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all faas metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Executions that reached a terminal state, labeled by status.
pub static EXECUTIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Wall-clock duration of container executions in seconds.
pub static EXECUTION_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Executions currently being processed by this process.
pub static EXECUTIONS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Last observed number of unacknowledged queue messages.
pub static QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Last observed number of worker replicas.
pub static WORKER_REPLICAS: OnceLock<Gauge> = OnceLock::new();

/// Scale actions issued, labeled by direction.
pub static SCALE_ACTIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Messages moved to the dead-letter stream.
pub static DEAD_LETTERED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling this more than once keeps the first registry.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric construction or registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let executions_total = CounterVec::new(
        Opts::new("faas_executions_total", "Executions that reached a terminal state"),
        &["status"],
    )?;

    let execution_duration = Histogram::with_opts(
        HistogramOpts::new(
            "faas_execution_duration_seconds",
            "Container execution duration in seconds",
        )
        .buckets(vec![0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]),
    )?;

    let executions_in_progress = Gauge::new(
        "faas_executions_in_progress",
        "Executions currently being processed",
    )?;

    let queue_depth = Gauge::new("faas_queue_depth", "Unacknowledged messages in the queue")?;

    let worker_replicas = Gauge::new("faas_worker_replicas", "Running worker replicas")?;

    let scale_actions_total = CounterVec::new(
        Opts::new("faas_scale_actions_total", "Scale actions issued"),
        &["direction"],
    )?;

    let dead_lettered_total = Counter::new(
        "faas_dead_lettered_total",
        "Messages moved to the dead-letter stream",
    )?;

    registry.register(Box::new(executions_total.clone()))?;
    registry.register(Box::new(execution_duration.clone()))?;
    registry.register(Box::new(executions_in_progress.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(worker_replicas.clone()))?;
    registry.register(Box::new(scale_actions_total.clone()))?;
    registry.register(Box::new(dead_lettered_total.clone()))?;

    // Losing a race with a concurrent init leaves the winner's metrics in place
    let _ = REGISTRY.set(registry);
    let _ = EXECUTIONS_TOTAL.set(executions_total);
    let _ = EXECUTION_DURATION.set(execution_duration);
    let _ = EXECUTIONS_IN_PROGRESS.set(executions_in_progress);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = WORKER_REPLICAS.set(worker_replicas);
    let _ = SCALE_ACTIONS_TOTAL.set(scale_actions_total);
    let _ = DEAD_LETTERED_TOTAL.set(dead_lettered_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of metrics when the registry has not been
/// initialized or encoding fails.
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

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
