//! High-level recording interface over the raw Prometheus metrics.

use super::prometheus::{
    DEAD_LETTERED_TOTAL, EXECUTIONS_IN_PROGRESS, EXECUTIONS_TOTAL, EXECUTION_DURATION,
    QUEUE_DEPTH, SCALE_ACTIONS_TOTAL, WORKER_REPLICAS,
};

/// Metrics collector for recording faas operational metrics.
///
/// Cheap to clone; all state lives in the global registry.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record an execution that reached a terminal state.
    pub fn record_execution(&self, status: &str, duration_secs: f64) {
        if let Some(total) = EXECUTIONS_TOTAL.get() {
            total.with_label_values(&[status]).inc();
        }

        if let Some(duration) = EXECUTION_DURATION.get() {
            duration.observe(duration_secs);
        }

        tracing::trace!(
            status = status,
            duration_secs = duration_secs,
            "Recorded execution metric"
        );
    }

    /// Mark one execution as started in this process.
    pub fn execution_started(&self) {
        if let Some(gauge) = EXECUTIONS_IN_PROGRESS.get() {
            gauge.inc();
        }
    }

    /// Mark one execution as no longer in progress.
    pub fn execution_finished(&self) {
        if let Some(gauge) = EXECUTIONS_IN_PROGRESS.get() {
            gauge.dec();
        }
    }

    pub fn set_queue_depth(&self, depth: usize) {
        if let Some(gauge) = QUEUE_DEPTH.get() {
            gauge.set(depth as f64);
        }
    }

    pub fn set_worker_replicas(&self, replicas: usize) {
        if let Some(gauge) = WORKER_REPLICAS.get() {
            gauge.set(replicas as f64);
        }
    }

    /// Record a scale action in the given direction ("up" or "down").
    pub fn record_scale_action(&self, direction: &str) {
        if let Some(counter) = SCALE_ACTIONS_TOTAL.get() {
            counter.with_label_values(&[direction]).inc();
        }
    }

    pub fn record_dead_letter(&self) {
        if let Some(counter) = DEAD_LETTERED_TOTAL.get() {
            counter.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_recording_without_init_is_noop() {
        let collector = MetricsCollector::new();
        collector.record_execution("completed", 1.5);
        collector.execution_started();
        collector.execution_finished();
        collector.set_queue_depth(4);
    }

    #[test]
    fn test_recorded_values_are_exported() {
        init_metrics().expect("init");
        let collector = MetricsCollector::new();

        collector.record_execution("failed", 0.2);
        collector.record_scale_action("up");
        collector.set_worker_replicas(3);

        let text = export_metrics();
        assert!(text.contains("faas_executions_total{status=\"failed\"}"));
        assert!(text.contains("faas_scale_actions_total{direction=\"up\"}"));
        assert!(text.contains("faas_worker_replicas"));
    }
}
