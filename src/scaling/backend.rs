//! Orchestration backend that runs worker replicas.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::info;

use crate::error::RuntimeError;
use crate::execution::{ContainerRuntime, ContainerSpec, DockerRuntime};

/// Ordinal offset in replica names, so the first replica is `<service>-100`.
pub const REPLICA_BASE_INDEX: usize = 100;

/// Seconds a replica gets to drain before it is killed.
pub const STOP_GRACE_SECS: i64 = 10;

/// Name of the replica with the given zero-based ordinal.
pub fn replica_name(service: &str, ordinal: usize) -> String {
    format!("{}-{}", service, REPLICA_BASE_INDEX + ordinal)
}

/// Ordinal encoded in a replica name, if the name belongs to `service`.
pub fn replica_ordinal(service: &str, name: &str) -> Option<usize> {
    let index: usize = name.strip_prefix(service)?.strip_prefix('-')?.parse().ok()?;
    index.checked_sub(REPLICA_BASE_INDEX)
}

/// Runs, stops and counts worker replicas.
#[async_trait]
pub trait ReplicaBackend: Send + Sync {
    /// Starts `count` additional replicas of `service`.
    async fn run_replicas(&self, service: &str, count: usize) -> Result<(), RuntimeError>;

    /// Stops and removes one replica by name.
    async fn stop_replica(&self, name: &str) -> Result<(), RuntimeError>;

    /// Names of the existing replicas of `service`, stopped ones included,
    /// lowest ordinal first. Ordinals may have gaps.
    async fn list_replicas(&self, service: &str) -> Result<Vec<String>, RuntimeError>;

    /// Number of replicas of `service`, stopped ones included.
    async fn count_replicas(&self, service: &str) -> Result<usize, RuntimeError> {
        Ok(self.list_replicas(service).await?.len())
    }
}

/// Container settings shared by every worker replica.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaTemplate {
    pub image: String,
    pub network: String,
    pub env: Vec<String>,
    pub volumes: Vec<String>,
}

impl ReplicaTemplate {
    /// Worker image on `network` with the Docker socket mounted, so replicas
    /// can start function containers themselves.
    pub fn new(image: impl Into<String>, network: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            network: network.into(),
            env: Vec::new(),
            volumes: vec!["/var/run/docker.sock:/var/run/docker.sock".to_string()],
        }
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }
}

/// [`ReplicaBackend`] that runs replicas as plain Docker containers.
pub struct DockerReplicaBackend {
    runtime: DockerRuntime,
    template: ReplicaTemplate,
}

impl DockerReplicaBackend {
    pub fn new(runtime: DockerRuntime, template: ReplicaTemplate) -> Self {
        Self { runtime, template }
    }

    async fn replicas(&self, service: &str) -> Result<BTreeMap<usize, String>, RuntimeError> {
        // The daemon's name filter is a substring match
        let containers = self.runtime.list_by_name(service).await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| replica_ordinal(service, &c.name).map(|ordinal| (ordinal, c.name)))
            .collect())
    }
}

#[async_trait]
impl ReplicaBackend for DockerReplicaBackend {
    async fn run_replicas(&self, service: &str, count: usize) -> Result<(), RuntimeError> {
        let taken = self.replicas(service).await?;
        let free = (0..).filter(|ordinal| !taken.contains_key(ordinal)).take(count);

        for ordinal in free {
            let name = replica_name(service, ordinal);
            let spec = ContainerSpec::new(&name, &self.template.image)
                .with_env(self.template.env.clone())
                .with_network(&self.template.network)
                .with_volumes(self.template.volumes.clone());

            let handle = self.runtime.create(&spec).await?;
            self.runtime.start(&handle).await?;
            info!(replica = %name, container_id = %handle.id, "Worker replica started");
        }

        Ok(())
    }

    async fn stop_replica(&self, name: &str) -> Result<(), RuntimeError> {
        self.runtime.stop(name, STOP_GRACE_SECS).await?;
        self.runtime.remove_by_id(name, true).await?;
        info!(replica = name, "Worker replica stopped and removed");
        Ok(())
    }

    async fn list_replicas(&self, service: &str) -> Result<Vec<String>, RuntimeError> {
        Ok(self.replicas(service).await?.into_values().collect())
    }
}
