//! In-process store backends.
//!
//! Records are kept serialized so the same encode/decode path as the Redis
//! backend is exercised.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    ExecutionStore, FunctionRepository, SecretRepository, EXECUTIONS_BUCKET, FUNCTIONS_BUCKET,
    SECRETS_BUCKET,
};
use crate::error::StoreError;
use crate::model::{Execution, Function, Secret};

/// Execution records held in memory.
#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    records: RwLock<HashMap<String, String>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn put(&self, execution: &Execution) -> Result<(), StoreError> {
        let data = serde_json::to_string(execution)?;
        self.records
            .write()
            .await
            .insert(execution.id.clone(), data);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Execution, StoreError> {
        let records = self.records.read().await;
        let data = records.get(id).ok_or_else(|| StoreError::NotFound {
            bucket: EXECUTIONS_BUCKET.to_string(),
            key: id.to_string(),
        })?;
        Ok(serde_json::from_str(data)?)
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.records.read().await.keys().cloned().collect())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.records.write().await.remove(id);
        Ok(())
    }

    async fn compare_and_put(&self, execution: &Execution) -> Result<Execution, StoreError> {
        let mut records = self.records.write().await;

        let actual = match records.get(&execution.id) {
            Some(data) => serde_json::from_str::<Execution>(data)?.version,
            None => 0,
        };
        if actual != execution.version {
            return Err(StoreError::VersionConflict {
                key: execution.id.clone(),
                expected: execution.version,
                actual,
            });
        }

        let mut written = execution.clone();
        written.version += 1;
        records.insert(written.id.clone(), serde_json::to_string(&written)?);
        Ok(written)
    }
}

/// Functions and secrets held in memory.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    functions: RwLock<HashMap<String, Function>>,
    secrets: RwLock<HashMap<(String, String), Secret>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_function(&self, function: Function) {
        self.functions
            .write()
            .await
            .insert(function.id.clone(), function);
    }

    pub async fn insert_secret(&self, secret: Secret) {
        self.secrets
            .write()
            .await
            .insert((secret.user_id.clone(), secret.name.clone()), secret);
    }
}

#[async_trait]
impl FunctionRepository for MemoryCatalog {
    async fn get_by_id(&self, id: &str) -> Result<Function, StoreError> {
        self.functions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                bucket: FUNCTIONS_BUCKET.to_string(),
                key: id.to_string(),
            })
    }
}

#[async_trait]
impl SecretRepository for MemoryCatalog {
    async fn get_by_name(&self, user_id: &str, name: &str) -> Result<Secret, StoreError> {
        self.secrets
            .read()
            .await
            .get(&(user_id.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                bucket: SECRETS_BUCKET.to_string(),
                key: format!("{}/{}", user_id, name),
            })
    }
}
