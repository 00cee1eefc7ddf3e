//! Pool of competing consumers inside one worker process.
//!
//! Each worker is a distinct member of the queue's delivery group and runs
//! as its own task. A broadcast signal stops them: a worker blocked on
//! fetch exits at once, a worker mid-execution finishes and persists first.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::processor::{ExecutionProcessor, HandleOutcome};
use crate::model::ExecutionStatus;
use crate::queue::{Delivery, Disposition, WorkQueue};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Pool is already running")]
    AlreadyRunning,

    #[error("Pool is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of consumers to run.
    pub num_workers: usize,
    /// Prefix of consumer names; worker `i` is `{prefix}-{i}`.
    pub consumer_prefix: String,
    /// How long one fetch may block waiting for a message.
    pub fetch_wait: Duration,
    /// Pause after a failed fetch.
    pub error_backoff: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            num_workers: 1,
            consumer_prefix: format!("worker-{}", &suffix[..8]),
            fetch_wait: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_consumer_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.consumer_prefix = prefix.into();
        self
    }

    pub fn with_fetch_wait(mut self, wait: Duration) -> Self {
        self.fetch_wait = wait;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub num_workers: usize,
    /// Workers currently handling a delivery.
    pub active_workers: usize,
    pub executions_completed: u64,
    pub executions_failed: u64,
    /// Deliveries of already-finished executions.
    pub duplicates: u64,
    /// Deliveries handed back to the queue.
    pub redeliveries: u64,
    pub average_execution_duration: Duration,
}

impl PoolStats {
    /// Executions that reached a terminal status.
    pub fn total_processed(&self) -> u64 {
        self.executions_completed + self.executions_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.executions_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    completed: AtomicU64,
    failed: AtomicU64,
    duplicates: AtomicU64,
    redeliveries: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            redeliveries: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record(&self, outcome: &HandleOutcome, duration: Duration) {
        let counter = match outcome {
            HandleOutcome::Finished(ExecutionStatus::Completed) => &self.completed,
            HandleOutcome::Finished(_) => &self.failed,
            HandleOutcome::Duplicate(_) => &self.duplicates,
            HandleOutcome::Malformed(_) | HandleOutcome::Unpersisted(_) => &self.redeliveries,
        };
        counter.fetch_add(1, Ordering::SeqCst);

        if matches!(outcome, HandleOutcome::Finished(_)) {
            self.total_duration_ms
                .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
        }
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.completed.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let finished = completed + failed;
        let average = if finished > 0 {
            Duration::from_millis(total_duration_ms / finished)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            executions_completed: completed,
            executions_failed: failed,
            duplicates: self.duplicates.load(Ordering::SeqCst),
            redeliveries: self.redeliveries.load(Ordering::SeqCst),
            average_execution_duration: average,
        }
    }
}

/// Manages the consumers of one worker process.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<dyn WorkQueue>,
    processor: Arc<ExecutionProcessor>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<dyn WorkQueue>,
        processor: Arc<ExecutionProcessor>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            queue,
            processor,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Spawns all workers.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("{}-{}", self.config.consumer_prefix, i),
                queue: Arc::clone(&self.queue),
                processor: Arc::clone(&self.processor),
                shutdown_rx: self.shutdown_tx.subscribe(),
                fetch_wait: self.config.fetch_wait,
                error_backoff: self.config.error_backoff,
                stats: Arc::clone(&self.stats),
            };

            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            num_workers = self.config.num_workers,
            consumer_prefix = %self.config.consumer_prefix,
            "Worker pool started"
        );

        Ok(())
    }

    /// Signals every worker to stop and waits for in-flight executions.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout. Their unacknowledged messages are redelivered
    /// after the ack window.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let handles: Vec<_> = self.worker_handles.drain(..).collect();
        let shutdown_future = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

/// A single competing consumer.
struct Worker {
    id: String,
    queue: Arc<dyn WorkQueue>,
    processor: Arc<ExecutionProcessor>,
    shutdown_rx: broadcast::Receiver<()>,
    fetch_wait: Duration,
    error_backoff: Duration,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            let fetched = tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                fetched = self.queue.fetch(&self.id, self.fetch_wait) => fetched,
            };

            match fetched {
                Ok(Some(delivery)) => self.process(delivery).await,
                Ok(None) => debug!(worker_id = %self.id, "No messages available"),
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to fetch message");
                    tokio::select! {
                        _ = self.shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(self.error_backoff) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn process(&self, delivery: Delivery) {
        debug!(
            worker_id = %self.id,
            message_id = %delivery.message_id,
            delivery_count = delivery.delivery_count,
            "Received message"
        );

        self.stats.increment_active();
        let started = Instant::now();
        let outcome = self.processor.handle(&self.id, &delivery).await;
        self.stats.record(&outcome, started.elapsed());
        self.stats.decrement_active();

        let settled = match outcome.disposition() {
            Disposition::Ack => self.queue.ack(&delivery).await,
            Disposition::Nak => self.queue.nak(&delivery).await,
        };

        if let Err(e) = settled {
            warn!(
                worker_id = %self.id,
                message_id = %delivery.message_id,
                disposition = ?outcome.disposition(),
                error = %e,
                "Failed to settle message, it will be redelivered after the ack window"
            );
        }
    }
}
