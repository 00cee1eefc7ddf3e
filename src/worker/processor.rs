//! Handling of one queue delivery.
//!
//! The message is acknowledged only once the terminal record has been
//! persisted. Every earlier exit either acknowledges a duplicate or
//! negatively acknowledges so the queue redelivers.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::execution::FunctionExecutor;
use crate::metrics::MetricsCollector;
use crate::model::{Execution, ExecutionStatus};
use crate::queue::{Delivery, Disposition};
use crate::store::ExecutionStore;

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum HandleOutcome {
    /// Terminal record persisted with the given status.
    Finished(ExecutionStatus),
    /// The execution already reached a terminal status; nothing was run.
    Duplicate(ExecutionStatus),
    /// The payload could not be decoded.
    Malformed(String),
    /// A record write or read failed; the outcome is not durable.
    Unpersisted(String),
}

impl HandleOutcome {
    /// Acknowledge or redeliver.
    pub fn disposition(&self) -> Disposition {
        match self {
            HandleOutcome::Finished(_) | HandleOutcome::Duplicate(_) => Disposition::Ack,
            HandleOutcome::Malformed(_) | HandleOutcome::Unpersisted(_) => Disposition::Nak,
        }
    }
}

/// Drives one execution through its status transitions.
pub struct ExecutionProcessor {
    store: Arc<dyn ExecutionStore>,
    executor: Arc<dyn FunctionExecutor>,
    metrics: MetricsCollector,
}

impl ExecutionProcessor {
    pub fn new(store: Arc<dyn ExecutionStore>, executor: Arc<dyn FunctionExecutor>) -> Self {
        Self {
            store,
            executor,
            metrics: MetricsCollector::new(),
        }
    }

    pub async fn handle(&self, worker_id: &str, delivery: &Delivery) -> HandleOutcome {
        let snapshot = match delivery.execution() {
            Ok(execution) => execution,
            Err(e) => {
                warn!(
                    worker_id = worker_id,
                    message_id = %delivery.message_id,
                    delivery_count = delivery.delivery_count,
                    error = %e,
                    "Malformed execution message"
                );
                return HandleOutcome::Malformed(e.to_string());
            }
        };

        let record = match self.claim(worker_id, snapshot, delivery).await {
            Ok(Claim::Run(record)) => record,
            Ok(Claim::Done(status)) => {
                info!(
                    worker_id = worker_id,
                    message_id = %delivery.message_id,
                    status = %status,
                    "Execution already finished, acknowledging duplicate delivery"
                );
                return HandleOutcome::Duplicate(status);
            }
            Err(reason) => return HandleOutcome::Unpersisted(reason),
        };

        self.run(worker_id, record).await
    }

    /// Reads the stored record and moves it to Running for this attempt.
    async fn claim(
        &self,
        worker_id: &str,
        snapshot: Execution,
        delivery: &Delivery,
    ) -> Result<Claim, String> {
        let mut record = match self.store.get(&snapshot.id).await {
            Ok(stored) => stored,
            Err(e) if e.is_not_found() => {
                warn!(
                    worker_id = worker_id,
                    execution_id = %snapshot.id,
                    "No stored record, recreating from message snapshot"
                );
                let mut fresh = snapshot;
                fresh.version = 0;
                fresh
            }
            Err(e) => {
                warn!(
                    worker_id = worker_id,
                    execution_id = %snapshot.id,
                    error = %e,
                    "Failed to read execution record"
                );
                return Err(e.to_string());
            }
        };

        match record.status {
            status if status.is_terminal() => return Ok(Claim::Done(status)),
            ExecutionStatus::Running => {
                warn!(
                    worker_id = worker_id,
                    execution_id = %record.id,
                    attempt = record.attempts + 1,
                    delivery_count = delivery.delivery_count,
                    "Previous attempt did not finish, running again"
                );
            }
            _ => {
                if let Err(e) = record.mark_running(Utc::now()) {
                    error!(worker_id = worker_id, error = %e, "Cannot start execution");
                    return Err(e.to_string());
                }
            }
        }

        record.begin_attempt();

        self.store.compare_and_put(&record).await.map(Claim::Run).map_err(|e| {
            warn!(
                worker_id = worker_id,
                execution_id = %record.id,
                error = %e,
                "Failed to persist running state"
            );
            e.to_string()
        })
    }

    async fn run(&self, worker_id: &str, mut record: Execution) -> HandleOutcome {
        info!(
            worker_id = worker_id,
            execution_id = %record.id,
            function_id = %record.function_id,
            attempt = record.attempts,
            "Executing function"
        );

        let started = Instant::now();
        self.metrics.execution_started();
        let result = self.executor.execute(&record).await;
        self.metrics.execution_finished();
        let elapsed = started.elapsed();

        let now = Utc::now();
        let transition = match &result {
            Ok(output) => record.complete(output.stdout.clone(), now),
            Err(e) => record.fail(e.to_string(), e.captured_output(), now),
        };
        if let Err(e) = transition {
            error!(worker_id = worker_id, error = %e, "Cannot finish execution");
            return HandleOutcome::Unpersisted(e.to_string());
        }

        let status = record.status;
        if let Err(e) = self.store.compare_and_put(&record).await {
            warn!(
                worker_id = worker_id,
                execution_id = %record.id,
                status = %status,
                error = %e,
                "Failed to persist final state, redelivery may run the function again"
            );
            return HandleOutcome::Unpersisted(e.to_string());
        }

        self.metrics.record_execution(&status.to_string(), elapsed.as_secs_f64());

        match result {
            Ok(_) => info!(
                worker_id = worker_id,
                execution_id = %record.id,
                duration_ms = elapsed.as_millis() as u64,
                "Execution completed"
            ),
            Err(e) => warn!(
                worker_id = worker_id,
                execution_id = %record.id,
                failure_point = e.failure_point(),
                error = %e,
                "Execution failed"
            ),
        }

        HandleOutcome::Finished(status)
    }
}

enum Claim {
    Run(Execution),
    Done(ExecutionStatus),
}
