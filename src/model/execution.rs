//! Execution records and their status lifecycle.
//!
//! Status transitions are strictly `Pending → Running → Completed | Failed`.
//! Every mutation goes through [`Execution::transition`] so an illegal
//! sequence is rejected before anything reaches the record store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransitionError;

/// Status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Accepted and enqueued, not yet picked up by a worker.
    Pending,
    /// A worker is running the function container.
    Running,
    /// The container exited successfully; output holds its stdout.
    Completed,
    /// The run failed, timed out or could not be started.
    Failed,
}

impl ExecutionStatus {
    /// Returns whether the status is final. Terminal records are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }

    /// Returns whether the execution counts against the owner's concurrency cap.
    pub fn is_active(&self) -> bool {
        matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    /// Returns whether `next` is the immediate successor of this status.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        matches!(
            (self, next),
            (ExecutionStatus::Pending, ExecutionStatus::Running)
                | (ExecutionStatus::Running, ExecutionStatus::Completed)
                | (ExecutionStatus::Running, ExecutionStatus::Failed)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "pending"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One invocation of a user function.
///
/// The same structure is persisted in the record store and carried as the
/// queue message body (the snapshot taken at submission time).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Unique identifier.
    pub id: String,
    /// Function being invoked.
    pub function_id: String,
    /// Owner of the execution.
    pub user_id: String,
    /// Current lifecycle status.
    pub status: ExecutionStatus,
    /// Raw input payload, usually JSON.
    #[serde(default)]
    pub input: String,
    /// Captured stdout of the function container.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    /// Failure description when status is `Failed`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// When the execution was submitted.
    pub created_at: DateTime<Utc>,
    /// When a worker first moved it to `Running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When it reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of container runs started for this execution.
    #[serde(default)]
    pub attempts: u32,
    /// Store version, bumped on every successful write.
    #[serde(default)]
    pub version: u64,
}

impl Execution {
    /// Creates a new pending execution with a fresh id.
    pub fn new(
        function_id: impl Into<String>,
        user_id: impl Into<String>,
        input: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            function_id: function_id.into(),
            user_id: user_id.into(),
            status: ExecutionStatus::Pending,
            input: input.into(),
            output: String::new(),
            error: String::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            attempts: 0,
            version: 0,
        }
    }

    /// Moves the execution to `Running`.
    pub fn mark_running(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(ExecutionStatus::Running)?;
        self.started_at = Some(at);
        Ok(())
    }

    /// Moves the execution to `Completed` with the captured output.
    pub fn complete(
        &mut self,
        output: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(ExecutionStatus::Completed)?;
        self.output = output.into();
        self.completed_at = Some(at);
        Ok(())
    }

    /// Moves the execution to `Failed`.
    ///
    /// `output` keeps whatever stdout was captured before the failure.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        output: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(ExecutionStatus::Failed)?;
        self.error = error.into();
        if let Some(output) = output {
            self.output = output;
        }
        self.completed_at = Some(at);
        Ok(())
    }

    /// Records the start of another container run.
    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Returns whether the execution is in a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn transition(&mut self, next: ExecutionStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}
