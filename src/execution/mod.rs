//! Container execution layer.
//!
//! [`ContainerExecutor`] runs one execution per fresh container through a
//! [`ContainerRuntime`]; [`DockerRuntime`] is the bollard-backed runtime.
//!
//! ```text
//! resolve → pull → env → Created → Started → Waiting → Exited | WaitFailed | TimedOut → Removed
//! ```

pub mod container;
pub mod docker_client;
pub mod executor;
pub mod runtime;

pub use container::{ContainerRun, RunState, WaitOutcome};
pub use docker_client::{ContainerSummary, DockerRuntime};
pub use executor::{
    ContainerExecutor, ExecutionOutput, ExecutorConfig, FunctionExecutor, API_BASE_URL_ENV,
    DEFAULT_API_BASE_URL, DEFAULT_EXECUTION_TIMEOUT, DEFAULT_NETWORK,
};
pub use runtime::{ContainerHandle, ContainerRuntime, ContainerSpec};
