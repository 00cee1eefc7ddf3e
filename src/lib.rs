//! faas_runtime: the execution pipeline of a function platform.
//!
//! Submissions are persisted as Pending records and published on a durable
//! work queue. Worker processes consume the queue, run each execution in a
//! fresh container and record the outcome. An autoscaler sizes the worker
//! fleet against queue depth.

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod execution;
pub mod metrics;
pub mod model;
pub mod queue;
pub mod scaling;
pub mod shutdown;
pub mod store;
pub mod submission;
pub mod worker;

// Re-export commonly used error types
pub use error::{
    AdmissionError, ExecutorError, RuntimeError, ScalingError, StoreError, TransitionError,
};
pub use queue::QueueError;
