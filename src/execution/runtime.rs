//! Container runtime capability consumed by the executor and the replica
//! backend.

use async_trait::async_trait;

use crate::error::RuntimeError;

/// Everything needed to create one container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Command arguments; `None` keeps the image's default command.
    pub cmd: Option<Vec<String>>,
    /// Environment as `KEY=value` entries.
    pub env: Vec<String>,
    /// Network the container joins.
    pub network: Option<String>,
    /// Bind mounts in `host:container` form.
    pub volumes: Vec<String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            cmd: None,
            env: Vec::new(),
            network: None,
            volumes: Vec::new(),
        }
    }

    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = Some(cmd);
        self
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn with_volumes(mut self, volumes: Vec<String>) -> Self {
        self.volumes = volumes;
        self
    }
}

/// Identifies a created container until it is removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
}

/// Low-level container operations.
///
/// `wait` is unbounded here; callers apply their own deadline.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Makes the image available locally.
    async fn pull(&self, image: &str) -> Result<(), RuntimeError>;

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError>;

    async fn start(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    /// Waits until the container leaves the running state and returns its
    /// exit code.
    async fn wait(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError>;

    /// Returns everything the container wrote to stdout. Stderr is dropped.
    async fn stdout(&self, handle: &ContainerHandle) -> Result<String, RuntimeError>;

    async fn remove(&self, handle: &ContainerHandle, force: bool) -> Result<(), RuntimeError>;
}
