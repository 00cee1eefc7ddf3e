//! End-to-end tests of the execution pipeline with in-process backends.
//!
//! Submission, queue, worker pool, executor and record store are the real
//! implementations; only the container runtime is scripted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use faas_runtime::error::{AdmissionError, RuntimeError, StoreError};
use faas_runtime::execution::{
    ContainerExecutor, ContainerHandle, ContainerRuntime, ContainerSpec, ExecutorConfig,
};
use faas_runtime::model::{Execution, ExecutionStatus, Function};
use faas_runtime::queue::{MemoryQueue, QueueSettings, WorkQueue};
use faas_runtime::store::{ExecutionStore, MemoryCatalog, MemoryExecutionStore};
use faas_runtime::submission::SubmissionService;
use faas_runtime::worker::{ExecutionProcessor, WorkerPool, WorkerPoolConfig};

/// Runtime whose behavior is chosen by image name.
///
/// - `echo:latest` prints the command argument (or `hello`) and exits 0
/// - `fail:latest` prints `partial` and exits 2
/// - `slow:latest` never exits
#[derive(Default)]
struct ScriptedRuntime {
    containers: Mutex<HashMap<String, ContainerSpec>>,
    creates: AtomicUsize,
    removes: AtomicUsize,
}

impl ScriptedRuntime {
    fn spec(&self, handle: &ContainerHandle) -> Result<ContainerSpec, RuntimeError> {
        self.containers
            .lock()
            .expect("lock")
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| RuntimeError::ContainerNotFound {
                id: handle.id.clone(),
            })
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        match image {
            "echo:latest" | "fail:latest" | "slow:latest" => Ok(()),
            other => Err(RuntimeError::PullFailed {
                image: other.to_string(),
                reason: "manifest unknown".to_string(),
            }),
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst);
        let id = format!("c-{}", n);
        self.containers
            .lock()
            .expect("lock")
            .insert(id.clone(), spec.clone());
        Ok(ContainerHandle {
            id,
            name: spec.name.clone(),
        })
    }

    async fn start(&self, _handle: &ContainerHandle) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError> {
        match self.spec(handle)?.image.as_str() {
            "slow:latest" => std::future::pending().await,
            "fail:latest" => Ok(2),
            _ => Ok(0),
        }
    }

    async fn stdout(&self, handle: &ContainerHandle) -> Result<String, RuntimeError> {
        let spec = self.spec(handle)?;
        Ok(match spec.image.as_str() {
            "fail:latest" => "partial".to_string(),
            _ => spec
                .cmd
                .and_then(|cmd| cmd.into_iter().next())
                .unwrap_or_else(|| "hello".to_string()),
        })
    }

    async fn remove(&self, handle: &ContainerHandle, _force: bool) -> Result<(), RuntimeError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.containers.lock().expect("lock").remove(&handle.id);
        Ok(())
    }
}

/// Store that records every status written per execution.
#[derive(Default)]
struct RecordingStore {
    inner: MemoryExecutionStore,
    history: Mutex<HashMap<String, Vec<ExecutionStatus>>>,
}

impl RecordingStore {
    fn observe(&self, execution: &Execution) {
        let mut history = self.history.lock().expect("lock");
        let seen = history.entry(execution.id.clone()).or_default();
        if seen.last() != Some(&execution.status) {
            seen.push(execution.status);
        }
    }

    fn history(&self, id: &str) -> Vec<ExecutionStatus> {
        self.history
            .lock()
            .expect("lock")
            .get(id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ExecutionStore for RecordingStore {
    async fn put(&self, execution: &Execution) -> Result<(), StoreError> {
        self.inner.put(execution).await?;
        self.observe(execution);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Execution, StoreError> {
        self.inner.get(id).await
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_keys().await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.inner.delete(id).await
    }

    async fn compare_and_put(&self, execution: &Execution) -> Result<Execution, StoreError> {
        let written = self.inner.compare_and_put(execution).await?;
        self.observe(&written);
        Ok(written)
    }
}

struct Platform {
    store: Arc<RecordingStore>,
    queue: Arc<MemoryQueue>,
    runtime: Arc<ScriptedRuntime>,
    submissions: SubmissionService,
    pool: WorkerPool,
}

async fn platform(max_concurrent: usize) -> Platform {
    let store = Arc::new(RecordingStore::default());
    let queue = Arc::new(MemoryQueue::new(QueueSettings::default()));
    let runtime = Arc::new(ScriptedRuntime::default());

    let catalog = Arc::new(MemoryCatalog::new());
    for (id, image) in [
        ("echo", "echo:latest"),
        ("fail", "fail:latest"),
        ("slow", "slow:latest"),
        ("ghost", "ghost:latest"),
    ] {
        catalog.insert_function(Function::new(id, "alice", image)).await;
    }

    let executor = ContainerExecutor::new(
        runtime.clone(),
        catalog.clone(),
        catalog.clone(),
        ExecutorConfig::default().with_timeout(Duration::from_secs(2)),
    );
    let processor = Arc::new(ExecutionProcessor::new(store.clone(), Arc::new(executor)));

    let pool = WorkerPool::new(
        WorkerPoolConfig::new(2)
            .with_consumer_prefix("it")
            .with_fetch_wait(Duration::from_millis(100))
            .with_shutdown_timeout(Duration::from_secs(5)),
        queue.clone(),
        processor,
    );

    let submissions = SubmissionService::new(store.clone(), catalog, queue.clone())
        .with_max_concurrent(max_concurrent);

    Platform {
        store,
        queue,
        runtime,
        submissions,
        pool,
    }
}

async fn wait_until_terminal(store: &RecordingStore, id: &str) -> Execution {
    for _ in 0..600 {
        let execution = store.get(id).await.expect("record exists");
        if execution.is_terminal() {
            return execution;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("execution {} never finished", id);
}

fn is_lifecycle_prefix(history: &[ExecutionStatus]) -> bool {
    use ExecutionStatus::*;
    matches!(
        history,
        [] | [Pending]
            | [Pending, Running]
            | [Pending, Running, Completed]
            | [Pending, Running, Failed]
    )
}

#[tokio::test(start_paused = true)]
async fn test_executions_reach_expected_outcomes() {
    let mut p = platform(10).await;
    p.pool.start().expect("start");

    let echo = p
        .submissions
        .create_execution("echo", "alice", "")
        .await
        .expect("submit echo");
    let failing = p
        .submissions
        .create_execution("fail", "alice", "{}")
        .await
        .expect("submit fail");
    let slow = p
        .submissions
        .create_execution("slow", "alice", "")
        .await
        .expect("submit slow");
    let ghost = p
        .submissions
        .create_execution("ghost", "alice", "")
        .await
        .expect("submit ghost");

    let echo = wait_until_terminal(&p.store, &echo.id).await;
    assert_eq!(echo.status, ExecutionStatus::Completed);
    assert_eq!(echo.output, "hello");
    assert!(echo.started_at.is_some() && echo.completed_at.is_some());

    let failing = wait_until_terminal(&p.store, &failing.id).await;
    assert_eq!(failing.status, ExecutionStatus::Failed);
    assert!(failing.error.contains("exited with code 2"));
    assert_eq!(failing.output, "partial");

    let slow = wait_until_terminal(&p.store, &slow.id).await;
    assert_eq!(slow.status, ExecutionStatus::Failed);
    assert!(slow.error.contains("timed out"));

    let ghost = wait_until_terminal(&p.store, &ghost.id).await;
    assert_eq!(ghost.status, ExecutionStatus::Failed);
    assert!(ghost.error.contains("ghost:latest"));

    p.pool.shutdown().await.expect("shutdown");

    // Pull failures never create a container; every created one is removed
    assert_eq!(p.runtime.creates.load(Ordering::SeqCst), 3);
    assert_eq!(p.runtime.removes.load(Ordering::SeqCst), 3);
    assert_eq!(p.queue.pending_count().await.expect("count"), 0);

    for execution in [&echo, &failing, &slow, &ghost] {
        let history = p.store.history(&execution.id);
        assert!(
            is_lifecycle_prefix(&history),
            "unexpected status history {:?}",
            history
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_delivery_is_not_rerun() {
    let mut p = platform(10).await;
    p.pool.start().expect("start");

    let submitted = p
        .submissions
        .create_execution("echo", "alice", "")
        .await
        .expect("submit");
    let finished = wait_until_terminal(&p.store, &submitted.id).await;
    assert_eq!(finished.status, ExecutionStatus::Completed);

    // Redeliver the submitted snapshot as the broker would
    p.queue.enqueue(&submitted).await.expect("enqueue duplicate");

    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        while p.queue.pending_count().await.expect("count") > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(drained.is_ok(), "duplicate was not acknowledged");

    p.pool.shutdown().await.expect("shutdown");

    assert_eq!(p.runtime.creates.load(Ordering::SeqCst), 1);
    assert_eq!(p.pool.stats().duplicates, 1);
    assert_eq!(
        p.store.get(&submitted.id).await.expect("get").version,
        finished.version
    );
}

#[tokio::test(start_paused = true)]
async fn test_admission_limit_leaves_no_trace() {
    let p = platform(2).await;

    // Workers are not started, so both stay Pending
    for _ in 0..2 {
        p.submissions
            .create_execution("slow", "alice", "")
            .await
            .expect("admitted");
    }

    let err = p
        .submissions
        .create_execution("echo", "alice", "")
        .await
        .expect_err("over the limit");
    assert!(matches!(err, AdmissionError::ConcurrencyLimit { .. }));
    assert_eq!(err.reason_code(), "concurrency_limit_exceeded");

    assert_eq!(p.store.list_keys().await.expect("keys").len(), 2);
    assert_eq!(p.queue.pending_count().await.expect("count"), 2);

    let listed = p.submissions.list_executions("alice").await.expect("list");
    assert!(listed
        .iter()
        .all(|execution| execution.status == ExecutionStatus::Pending));
}
