//! Redis-backed record store.
//!
//! Each bucket is a single Redis hash: field = record key, value = JSON.
//! Secrets are keyed `<user_id>/<secret_id>` and looked up by scanning the
//! owner's prefix for a matching name.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::{
    ExecutionStore, FunctionRepository, SecretRepository, EXECUTIONS_BUCKET, FUNCTIONS_BUCKET,
    SECRETS_BUCKET,
};
use crate::error::StoreError;
use crate::model::{Execution, Function, Secret};

/// Atomically replaces a record if its stored `version` matches.
///
/// KEYS[1] bucket, ARGV[1] field, ARGV[2] expected version, ARGV[3] new JSON.
/// Returns `{applied, actual_version}`.
const COMPARE_AND_PUT_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
local actual = 0
if current then
    local decoded = cjson.decode(current)
    if decoded['version'] then
        actual = tonumber(decoded['version'])
    end
end
if actual ~= tonumber(ARGV[2]) then
    return {0, actual}
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
return {1, actual}
"#;

/// Record store over a shared Redis connection.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    prefix: String,
    cas_script: Script,
}

impl RedisStore {
    /// Creates a store using `prefix` as namespace for bucket keys.
    pub fn new(redis: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
            cas_script: Script::new(COMPARE_AND_PUT_SCRIPT),
        }
    }

    fn bucket_key(&self, bucket: &str) -> String {
        if self.prefix.is_empty() {
            bucket.to_string()
        } else {
            format!("{}:{}", self.prefix, bucket)
        }
    }

    async fn hget_required(&self, bucket: &str, key: &str) -> Result<String, StoreError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.hget(self.bucket_key(bucket), key).await?;
        data.ok_or_else(|| StoreError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

#[async_trait]
impl ExecutionStore for RedisStore {
    async fn put(&self, execution: &Execution) -> Result<(), StoreError> {
        let data = serde_json::to_string(execution)?;
        let mut conn = self.redis.clone();
        conn.hset::<_, _, _, ()>(self.bucket_key(EXECUTIONS_BUCKET), &execution.id, data)
            .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Execution, StoreError> {
        let data = self.hget_required(EXECUTIONS_BUCKET, id).await?;
        Ok(serde_json::from_str(&data)?)
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let keys: Vec<String> = conn.hkeys(self.bucket_key(EXECUTIONS_BUCKET)).await?;
        Ok(keys)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.hdel::<_, _, ()>(self.bucket_key(EXECUTIONS_BUCKET), id)
            .await?;
        Ok(())
    }

    async fn compare_and_put(&self, execution: &Execution) -> Result<Execution, StoreError> {
        let mut written = execution.clone();
        written.version = execution.version + 1;
        let data = serde_json::to_string(&written)?;

        let mut conn = self.redis.clone();
        let mut invocation = self.cas_script.prepare_invoke();
        invocation
            .key(self.bucket_key(EXECUTIONS_BUCKET))
            .arg(&execution.id)
            .arg(execution.version)
            .arg(data);
        let (applied, actual): (i64, u64) = invocation.invoke_async(&mut conn).await?;

        if applied == 1 {
            Ok(written)
        } else {
            Err(StoreError::VersionConflict {
                key: execution.id.clone(),
                expected: execution.version,
                actual,
            })
        }
    }
}

#[async_trait]
impl FunctionRepository for RedisStore {
    async fn get_by_id(&self, id: &str) -> Result<Function, StoreError> {
        let data = self.hget_required(FUNCTIONS_BUCKET, id).await?;
        Ok(serde_json::from_str(&data)?)
    }
}

#[async_trait]
impl SecretRepository for RedisStore {
    async fn get_by_name(&self, user_id: &str, name: &str) -> Result<Secret, StoreError> {
        let mut conn = self.redis.clone();
        let bucket = self.bucket_key(SECRETS_BUCKET);
        let prefix = format!("{}/", user_id);

        let keys: Vec<String> = conn.hkeys(&bucket).await?;
        for key in keys.into_iter().filter(|k| k.starts_with(&prefix)) {
            let data: Option<String> = conn.hget(&bucket, &key).await?;
            let Some(data) = data else { continue };
            let secret: Secret = serde_json::from_str(&data)?;
            if secret.name == name {
                return Ok(secret);
            }
        }

        Err(StoreError::NotFound {
            bucket: SECRETS_BUCKET.to_string(),
            key: format!("{}{}", prefix, name),
        })
    }
}
