//! Prometheus-based metrics for workers and the autoscaler.
//!
//! ```ignore
//! use faas_runtime::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! MetricsCollector::new().record_execution("completed", 1.2);
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    DEAD_LETTERED_TOTAL, EXECUTIONS_IN_PROGRESS, EXECUTIONS_TOTAL, EXECUTION_DURATION,
    QUEUE_DEPTH, REGISTRY, SCALE_ACTIONS_TOTAL, WORKER_REPLICAS,
};
