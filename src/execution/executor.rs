//! Runs one execution in a fresh container.
//!
//! Steps, each with its own [`ExecutorError`] variant:
//!
//! 1. resolve the function and check ownership
//! 2. pull the image
//! 3. build the environment (base URL plus declared secrets)
//! 4. create the container
//! 5. start it
//! 6. wait, bounded by the execution timeout
//! 7. capture stdout
//! 8. force-remove the container
//!
//! Step 8 runs on every path once step 4 has succeeded. Nothing is retried
//! here; retries only happen through queue redelivery.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::ExecutorError;
use crate::execution::container::{ContainerRun, WaitOutcome};
use crate::execution::runtime::{ContainerRuntime, ContainerSpec};
use crate::model::{Execution, Function, FunctionInput};
use crate::store::{FunctionRepository, SecretRepository};

/// Default wall-clock limit for one container run.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Default network shared with the platform's gateway.
pub const DEFAULT_NETWORK: &str = "apisix";

/// Default object-storage base URL handed to functions.
pub const DEFAULT_API_BASE_URL: &str = "http://api:8080/api/function-objects";

/// Environment variable carrying the object-storage base URL.
pub const API_BASE_URL_ENV: &str = "API_BASE_URL";

/// Configuration for the container executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    /// Limit on the wait step, measured from wait start.
    pub timeout: Duration,
    /// Network every function container joins.
    pub network: String,
    /// Base URL injected as `API_BASE_URL`.
    pub api_base_url: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_EXECUTION_TIMEOUT,
            network: DEFAULT_NETWORK.to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
        }
    }
}

impl ExecutorConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }
}

/// Successful run of a function.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutput {
    /// Captured stdout.
    pub stdout: String,
    /// Time from container start to exit.
    pub duration: Duration,
}

/// Runs executions to completion. The worker depends on this, not on
/// containers directly.
#[async_trait]
pub trait FunctionExecutor: Send + Sync {
    async fn execute(&self, execution: &Execution) -> Result<ExecutionOutput, ExecutorError>;
}

/// [`FunctionExecutor`] backed by a container runtime.
pub struct ContainerExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    functions: Arc<dyn FunctionRepository>,
    secrets: Arc<dyn SecretRepository>,
    config: ExecutorConfig,
}

impl ContainerExecutor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        functions: Arc<dyn FunctionRepository>,
        secrets: Arc<dyn SecretRepository>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            runtime,
            functions,
            secrets,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    async fn resolve_function(&self, execution: &Execution) -> Result<Function, ExecutorError> {
        let function = self
            .functions
            .get_by_id(&execution.function_id)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    ExecutorError::FunctionNotFound {
                        function_id: execution.function_id.clone(),
                    }
                } else {
                    ExecutorError::FunctionLookup(e)
                }
            })?;

        if function.user_id != execution.user_id {
            return Err(ExecutorError::FunctionOwnerMismatch {
                function_id: function.id,
                user_id: execution.user_id.clone(),
            });
        }

        Ok(function)
    }

    async fn build_env(&self, execution: &Execution) -> Result<Vec<String>, ExecutorError> {
        let mut env = vec![format!("{}={}", API_BASE_URL_ENV, self.config.api_base_url)];

        let input =
            FunctionInput::parse(&execution.input).map_err(ExecutorError::InvalidInput)?;
        for name in &input.secrets {
            let secret = self
                .secrets
                .get_by_name(&execution.user_id, name)
                .await
                .map_err(|e| ExecutorError::SecretResolution {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            env.push(secret.to_env());
        }

        Ok(env)
    }

    fn container_spec(
        &self,
        execution: &Execution,
        function: &Function,
        env: Vec<String>,
    ) -> ContainerSpec {
        let name = format!("faas-{}-{}", execution.id, execution.attempts.max(1));
        let mut spec = ContainerSpec::new(name, &function.image_url)
            .with_env(env)
            .with_network(&self.config.network);

        if !execution.input.is_empty() {
            spec = spec.with_cmd(vec![execution.input.clone()]);
        }

        spec
    }

    /// Steps 5 to 7. Teardown is left to the caller.
    async fn drive(&self, run: &mut ContainerRun<'_>) -> Result<ExecutionOutput, ExecutorError> {
        run.start().await.map_err(ExecutorError::Start)?;
        let started = Instant::now();

        let code = match run.wait(self.config.timeout).await.map_err(ExecutorError::Wait)? {
            WaitOutcome::Exited(code) => code,
            WaitOutcome::TimedOut => {
                return Err(ExecutorError::Timeout {
                    after: self.config.timeout,
                })
            }
        };
        let duration = started.elapsed();

        let stdout = run.stdout().await.map_err(ExecutorError::Logs)?;

        if code != 0 {
            return Err(ExecutorError::NonZeroExit {
                code,
                output: stdout,
            });
        }

        Ok(ExecutionOutput { stdout, duration })
    }
}

#[async_trait]
impl FunctionExecutor for ContainerExecutor {
    async fn execute(&self, execution: &Execution) -> Result<ExecutionOutput, ExecutorError> {
        let function = self.resolve_function(execution).await?;

        self.runtime
            .pull(&function.image_url)
            .await
            .map_err(ExecutorError::ImagePull)?;

        let env = self.build_env(execution).await?;
        let spec = self.container_spec(execution, &function, env);

        let mut run = ContainerRun::create(self.runtime.as_ref(), &spec)
            .await
            .map_err(ExecutorError::Create)?;

        info!(
            execution_id = %execution.id,
            function_id = %function.id,
            image = %function.image_url,
            container_id = %run.handle().id,
            "Running function container"
        );

        let result = self.drive(&mut run).await;
        let last_state = run.remove().await;

        match &result {
            Ok(output) => debug!(
                execution_id = %execution.id,
                duration_ms = output.duration.as_millis() as u64,
                output_bytes = output.stdout.len(),
                "Function container finished"
            ),
            Err(e) => warn!(
                execution_id = %execution.id,
                failure_point = e.failure_point(),
                last_state = %last_state,
                error = %e,
                "Function container failed"
            ),
        }

        result
    }
}
