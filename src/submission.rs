//! Submission path: create, read and list executions.
//!
//! `create_execution` is the only producer of queue messages. It rejects a
//! submission before anything is written when the function is unknown, is
//! owned by someone else, or the caller already has `max_concurrent`
//! executions Pending or Running.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::AdmissionError;
use crate::model::Execution;
use crate::queue::WorkQueue;
use crate::store::{self, ExecutionStore, FunctionRepository};

/// Default per-user cap on Pending + Running executions.
pub const DEFAULT_MAX_CONCURRENT: usize = 10;

/// Accepts executions on behalf of callers.
pub struct SubmissionService {
    store: Arc<dyn ExecutionStore>,
    functions: Arc<dyn FunctionRepository>,
    queue: Arc<dyn WorkQueue>,
    max_concurrent: usize,
}

impl SubmissionService {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        functions: Arc<dyn FunctionRepository>,
        queue: Arc<dyn WorkQueue>,
    ) -> Self {
        Self {
            store,
            functions,
            queue,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Admits, persists and enqueues a new execution.
    ///
    /// The record is written as Pending before the message is published. If
    /// publishing fails the record is deleted again so no orphaned Pending
    /// record counts against the caller's limit.
    pub async fn create_execution(
        &self,
        function_id: &str,
        user_id: &str,
        input: &str,
    ) -> Result<Execution, AdmissionError> {
        self.admit(function_id, user_id).await?;

        let execution = Execution::new(function_id, user_id, input);
        let execution = self.store.compare_and_put(&execution).await?;

        if let Err(e) = self.queue.enqueue(&execution).await {
            warn!(
                execution_id = %execution.id,
                error = %e,
                "Enqueue failed, removing pending record"
            );
            if let Err(cleanup) = self.store.delete(&execution.id).await {
                warn!(
                    execution_id = %execution.id,
                    error = %cleanup,
                    "Failed to remove pending record"
                );
            }
            return Err(e.into());
        }

        info!(
            execution_id = %execution.id,
            function_id = function_id,
            user_id = user_id,
            "Execution submitted"
        );

        Ok(execution)
    }

    /// Reads one execution owned by `user_id`.
    pub async fn get_execution(&self, id: &str, user_id: &str) -> Result<Execution, AdmissionError> {
        let execution = match self.store.get(id).await {
            Ok(execution) => execution,
            Err(e) if e.is_not_found() => {
                return Err(AdmissionError::ExecutionNotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        if execution.user_id != user_id {
            return Err(AdmissionError::ExecutionForbidden {
                execution_id: id.to_string(),
                user_id: user_id.to_string(),
            });
        }

        Ok(execution)
    }

    /// Lists every execution owned by `user_id`, oldest first.
    pub async fn list_executions(&self, user_id: &str) -> Result<Vec<Execution>, AdmissionError> {
        Ok(store::list_for_user(self.store.as_ref(), user_id).await?)
    }

    async fn admit(&self, function_id: &str, user_id: &str) -> Result<(), AdmissionError> {
        let function = match self.functions.get_by_id(function_id).await {
            Ok(function) => function,
            Err(e) if e.is_not_found() => {
                return Err(AdmissionError::FunctionNotFound(function_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        if function.user_id != user_id {
            return Err(AdmissionError::Unauthorized {
                function_id: function_id.to_string(),
                user_id: user_id.to_string(),
            });
        }

        let active = store::count_active_for_user(self.store.as_ref(), user_id).await?;
        if active >= self.max_concurrent {
            warn!(
                user_id = user_id,
                active = active,
                max = self.max_concurrent,
                "Submission rejected by concurrency limit"
            );
            return Err(AdmissionError::ConcurrencyLimit {
                user_id: user_id.to_string(),
                active,
                max: self.max_concurrent,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutionStatus, Function};
    use crate::queue::{Delivery, MemoryQueue, QueueError, QueueSettings};
    use crate::store::{MemoryCatalog, MemoryExecutionStore};
    use async_trait::async_trait;
    use std::time::Duration;

    struct BrokenQueue;

    #[async_trait]
    impl WorkQueue for BrokenQueue {
        async fn enqueue(&self, _execution: &Execution) -> Result<String, QueueError> {
            Err(QueueError::ConnectionFailed("broker gone".to_string()))
        }

        async fn fetch(
            &self,
            _consumer: &str,
            _wait: Duration,
        ) -> Result<Option<Delivery>, QueueError> {
            Ok(None)
        }

        async fn ack(&self, _delivery: &Delivery) -> Result<(), QueueError> {
            Ok(())
        }

        async fn nak(&self, _delivery: &Delivery) -> Result<(), QueueError> {
            Ok(())
        }

        async fn pending_count(&self) -> Result<usize, QueueError> {
            Ok(0)
        }
    }

    struct Fixture {
        store: Arc<MemoryExecutionStore>,
        queue: Arc<MemoryQueue>,
        service: SubmissionService,
    }

    async fn fixture(max_concurrent: usize) -> Fixture {
        let store = Arc::new(MemoryExecutionStore::new());
        let catalog = Arc::new(MemoryCatalog::new());
        catalog
            .insert_function(Function::new("echo", "alice", "echo:latest"))
            .await;
        let queue = Arc::new(MemoryQueue::new(QueueSettings::default()));
        let service = SubmissionService::new(store.clone(), catalog, queue.clone())
            .with_max_concurrent(max_concurrent);

        Fixture {
            store,
            queue,
            service,
        }
    }

    #[tokio::test]
    async fn test_create_execution_persists_and_enqueues() {
        let f = fixture(10).await;

        let execution = f
            .service
            .create_execution("echo", "alice", "{\"x\":1}")
            .await
            .expect("create");

        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert_eq!(execution.version, 1);

        let stored = f.store.get(&execution.id).await.expect("stored");
        assert_eq!(stored, execution);

        let delivery = f
            .queue
            .fetch("w", Duration::ZERO)
            .await
            .expect("fetch")
            .expect("message");
        assert_eq!(delivery.execution().expect("decode").id, execution.id);
    }

    #[tokio::test]
    async fn test_unknown_function_is_rejected() {
        let f = fixture(10).await;

        let err = f
            .service
            .create_execution("missing", "alice", "")
            .await
            .expect_err("rejected");

        assert_eq!(err.reason_code(), "function_not_found");
        assert!(f.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_foreign_function_is_rejected() {
        let f = fixture(10).await;

        let err = f
            .service
            .create_execution("echo", "mallory", "")
            .await
            .expect_err("rejected");

        assert!(matches!(err, AdmissionError::Unauthorized { .. }));
        assert_eq!(f.queue.pending_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn test_concurrency_limit_blocks_without_side_effects() {
        let f = fixture(2).await;

        f.service
            .create_execution("echo", "alice", "")
            .await
            .expect("first");
        f.service
            .create_execution("echo", "alice", "")
            .await
            .expect("second");

        let err = f
            .service
            .create_execution("echo", "alice", "")
            .await
            .expect_err("third rejected");

        assert!(matches!(
            err,
            AdmissionError::ConcurrencyLimit {
                active: 2,
                max: 2,
                ..
            }
        ));
        assert_eq!(f.store.len().await, 2);
        assert_eq!(f.queue.pending_count().await.expect("count"), 2);
    }

    #[tokio::test]
    async fn test_finished_executions_free_the_limit() {
        let f = fixture(1).await;

        let first = f
            .service
            .create_execution("echo", "alice", "")
            .await
            .expect("first");

        let mut done = f.store.get(&first.id).await.expect("get");
        done.mark_running(chrono::Utc::now()).expect("running");
        done.complete("ok", chrono::Utc::now()).expect("completed");
        f.store.put(&done).await.expect("put");

        f.service
            .create_execution("echo", "alice", "")
            .await
            .expect("admitted after completion");
    }

    #[tokio::test]
    async fn test_enqueue_failure_removes_record() {
        let store = Arc::new(MemoryExecutionStore::new());
        let catalog = Arc::new(MemoryCatalog::new());
        catalog
            .insert_function(Function::new("echo", "alice", "echo:latest"))
            .await;
        let service = SubmissionService::new(store.clone(), catalog, Arc::new(BrokenQueue));

        let err = service
            .create_execution("echo", "alice", "")
            .await
            .expect_err("enqueue fails");

        assert_eq!(err.reason_code(), "queue_unavailable");
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_get_execution_checks_owner() {
        let f = fixture(10).await;
        let execution = f
            .service
            .create_execution("echo", "alice", "")
            .await
            .expect("create");

        let own = f
            .service
            .get_execution(&execution.id, "alice")
            .await
            .expect("owner reads");
        assert_eq!(own.id, execution.id);

        let err = f
            .service
            .get_execution(&execution.id, "bob")
            .await
            .expect_err("other user");
        assert_eq!(err.reason_code(), "unauthorized");

        let err = f
            .service
            .get_execution("nope", "alice")
            .await
            .expect_err("missing");
        assert_eq!(err.reason_code(), "execution_not_found");
    }

    #[tokio::test]
    async fn test_list_executions_for_owner() {
        let f = fixture(10).await;
        for _ in 0..3 {
            f.service
                .create_execution("echo", "alice", "")
                .await
                .expect("create");
        }

        assert_eq!(f.service.list_executions("alice").await.expect("list").len(), 3);
        assert!(f.service.list_executions("bob").await.expect("list").is_empty());
    }
}
