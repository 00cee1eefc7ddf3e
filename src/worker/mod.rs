//! Queue consumers that drive executions to a terminal status.

pub mod pool;
pub mod processor;

pub use pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
pub use processor::{ExecutionProcessor, HandleOutcome};
