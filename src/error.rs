//! Error types for the execution pipeline.
//!
//! Defines error types for each subsystem:
//! - Execution status transitions
//! - Key-value record storage
//! - Container runtime calls
//! - The container executor (one variant per failure point)
//! - Submission-time admission control
//! - Worker autoscaling
//!
//! Queue errors live next to the queue in `crate::queue`.

use std::time::Duration;

use thiserror::Error;

use crate::model::ExecutionStatus;
use crate::queue::QueueError;

/// An illegal execution status transition was attempted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid status transition for execution '{id}' from '{from}' to '{to}'")]
pub struct TransitionError {
    pub id: String,
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

/// Errors that can occur in the key-value record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Key '{key}' not found in bucket '{bucket}'")]
    NotFound { bucket: String, key: String },

    #[error("Version conflict on '{key}': expected {expected}, found {actual}")]
    VersionConflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Returns whether the error means the key does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Errors returned by a container runtime backend.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Failed to pull image '{image}': {reason}")]
    PullFailed { image: String, reason: String },

    #[error("Failed to create container: {0}")]
    CreateFailed(String),

    #[error("Failed to start container: {0}")]
    StartFailed(String),

    #[error("Error waiting for container: {0}")]
    WaitFailed(String),

    #[error("Failed to read container logs: {0}")]
    LogsFailed(String),

    #[error("Failed to stop container: {0}")]
    StopFailed(String),

    #[error("Failed to remove container: {0}")]
    RemoveFailed(String),

    #[error("Failed to list containers: {0}")]
    ListFailed(String),

    #[error("Container '{id}' not found")]
    ContainerNotFound { id: String },
}

/// Errors produced while running one execution in a container.
///
/// Every variant is terminal for that execution; nothing is retried inside
/// the executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Function '{function_id}' not found")]
    FunctionNotFound { function_id: String },

    #[error("Function '{function_id}' is not owned by user '{user_id}'")]
    FunctionOwnerMismatch {
        function_id: String,
        user_id: String,
    },

    #[error("Function lookup failed: {0}")]
    FunctionLookup(#[source] StoreError),

    #[error("Image pull failed: {0}")]
    ImagePull(#[source] RuntimeError),

    #[error("Execution input is not a valid input object: {0}")]
    InvalidInput(#[source] serde_json::Error),

    #[error("Secret '{name}' could not be resolved: {reason}")]
    SecretResolution { name: String, reason: String },

    #[error("Container creation failed: {0}")]
    Create(#[source] RuntimeError),

    #[error("Container start failed: {0}")]
    Start(#[source] RuntimeError),

    #[error("Container wait failed: {0}")]
    Wait(#[source] RuntimeError),

    #[error("Execution timed out after {}s", .after.as_secs())]
    Timeout { after: Duration },

    #[error("Reading container output failed: {0}")]
    Logs(#[source] RuntimeError),

    #[error("Function exited with code {code}")]
    NonZeroExit { code: i64, output: String },
}

impl ExecutorError {
    /// Short label naming the step that failed, used for metrics.
    pub fn failure_point(&self) -> &'static str {
        match self {
            ExecutorError::FunctionNotFound { .. }
            | ExecutorError::FunctionOwnerMismatch { .. }
            | ExecutorError::FunctionLookup(_) => "resolve_function",
            ExecutorError::ImagePull(_) => "pull_image",
            ExecutorError::InvalidInput(_) | ExecutorError::SecretResolution { .. } => {
                "resolve_secrets"
            }
            ExecutorError::Create(_) => "create",
            ExecutorError::Start(_) => "start",
            ExecutorError::Wait(_) => "wait",
            ExecutorError::Timeout { .. } => "timeout",
            ExecutorError::Logs(_) => "logs",
            ExecutorError::NonZeroExit { .. } => "exit_code",
        }
    }

    /// Returns whether this is the distinct timeout outcome.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecutorError::Timeout { .. })
    }

    /// Stdout captured before the failure, if any.
    pub fn captured_output(&self) -> Option<String> {
        match self {
            ExecutorError::NonZeroExit { output, .. } => Some(output.clone()),
            _ => None,
        }
    }
}

/// Errors rejecting or failing a submission.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("Function '{0}' not found")]
    FunctionNotFound(String),

    #[error("User '{user_id}' is not authorized to access function '{function_id}'")]
    Unauthorized {
        function_id: String,
        user_id: String,
    },

    #[error("User '{user_id}' has {active} active executions (max {max})")]
    ConcurrencyLimit {
        user_id: String,
        active: usize,
        max: usize,
    },

    #[error("Execution '{0}' not found")]
    ExecutionNotFound(String),

    #[error("User '{user_id}' is not authorized to view execution '{execution_id}'")]
    ExecutionForbidden {
        execution_id: String,
        user_id: String,
    },

    #[error("Record store error: {0}")]
    Store(#[from] StoreError),

    #[error("Work queue error: {0}")]
    Queue(#[from] QueueError),
}

impl AdmissionError {
    /// Machine-readable reason code surfaced to the caller.
    pub fn reason_code(&self) -> &'static str {
        match self {
            AdmissionError::FunctionNotFound(_) => "function_not_found",
            AdmissionError::Unauthorized { .. } | AdmissionError::ExecutionForbidden { .. } => {
                "unauthorized"
            }
            AdmissionError::ConcurrencyLimit { .. } => "concurrency_limit_exceeded",
            AdmissionError::ExecutionNotFound(_) => "execution_not_found",
            AdmissionError::Store(_) => "store_unavailable",
            AdmissionError::Queue(_) => "queue_unavailable",
        }
    }
}

/// Errors raised by one autoscaler evaluation. Never fatal to the loop.
#[derive(Debug, Error)]
pub enum ScalingError {
    #[error("Queue metrics unavailable: {0}")]
    Metrics(#[from] QueueError),

    #[error("Replica backend error: {0}")]
    Backend(#[from] RuntimeError),
}
