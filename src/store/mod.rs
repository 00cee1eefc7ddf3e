//! Key-value record storage.
//!
//! Three capabilities are consumed by the pipeline:
//!
//! - [`ExecutionStore`]: execution id → execution record, read and written by
//!   the submission path and the workers
//! - [`FunctionRepository`]: read-only function lookup by id
//! - [`SecretRepository`]: read-only secret lookup by owner and name
//!
//! Two backends implement them: [`RedisStore`] (one Redis hash per bucket)
//! and the in-process [`MemoryExecutionStore`] / [`MemoryCatalog`] used by
//! tests and local runs.
//!
//! Plain `put` is last-write-wins. `compare_and_put` guards a write with the
//! record's `version`, so two workers racing on a redelivered message cannot
//! silently overwrite each other's terminal state.

pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use tracing::debug;

use crate::error::StoreError;
use crate::model::{Execution, Function, Secret};

pub use self::memory::{MemoryCatalog, MemoryExecutionStore};
pub use self::redis_store::RedisStore;

/// Bucket holding execution records.
pub const EXECUTIONS_BUCKET: &str = "executions";
/// Bucket holding function definitions.
pub const FUNCTIONS_BUCKET: &str = "functions";
/// Bucket holding user secrets, keyed `<user_id>/<secret_id>`.
pub const SECRETS_BUCKET: &str = "secrets";

/// Durable mapping of execution id to execution record.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Unconditionally writes the record under its id.
    async fn put(&self, execution: &Execution) -> Result<(), StoreError>;

    /// Reads a record, `StoreError::NotFound` if absent.
    async fn get(&self, id: &str) -> Result<Execution, StoreError>;

    /// Lists every stored execution id.
    async fn list_keys(&self) -> Result<Vec<String>, StoreError>;

    /// Removes a record. Deleting a missing id is not an error.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Writes the record only if the stored version still equals
    /// `execution.version` (a missing record has version 0).
    ///
    /// Returns the record as written, with its version bumped.
    async fn compare_and_put(&self, execution: &Execution) -> Result<Execution, StoreError>;
}

/// Read-only function lookup.
#[async_trait]
pub trait FunctionRepository: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Result<Function, StoreError>;
}

/// Read-only secret lookup.
#[async_trait]
pub trait SecretRepository: Send + Sync {
    async fn get_by_name(&self, user_id: &str, name: &str) -> Result<Secret, StoreError>;
}

/// Lists all executions owned by `user_id`.
///
/// Entries that vanish between listing and reading are skipped; the store
/// has no snapshot isolation. Any other read failure is returned, so callers
/// never act on a partial view.
pub async fn list_for_user(
    store: &dyn ExecutionStore,
    user_id: &str,
) -> Result<Vec<Execution>, StoreError> {
    let keys = store.list_keys().await?;
    let mut executions = Vec::new();

    for key in keys {
        match store.get(&key).await {
            Ok(execution) if execution.user_id == user_id => executions.push(execution),
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                debug!(execution_id = %key, "Execution record vanished while listing");
            }
            Err(e) => return Err(e),
        }
    }

    executions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(executions)
}

/// Counts the executions of `user_id` that are still Pending or Running.
pub async fn count_active_for_user(
    store: &dyn ExecutionStore,
    user_id: &str,
) -> Result<usize, StoreError> {
    let executions = list_for_user(store, user_id).await?;
    Ok(executions
        .iter()
        .filter(|execution| execution.status.is_active())
        .count())
}
