//! Docker implementation of [`ContainerRuntime`] using the bollard crate.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tracing::debug;

use crate::error::RuntimeError;
use crate::execution::runtime::{ContainerHandle, ContainerRuntime, ContainerSpec};

/// A container as reported by the daemon's listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    /// Name without the leading slash.
    pub name: String,
    /// Daemon state, e.g. "running" or "exited".
    pub state: String,
}

/// Docker client wrapper for container operations.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

fn is_not_found(e: &BollardError) -> bool {
    matches!(
        e,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

impl DockerRuntime {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::DaemonUnavailable` if the daemon is not accessible.
    pub fn new() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker })
    }

    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    /// Checks if an image exists locally.
    pub async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    /// Sends SIGTERM and waits up to `grace_secs` before SIGKILL.
    pub async fn stop(&self, id: &str, grace_secs: i64) -> Result<(), RuntimeError> {
        let options = StopContainerOptions { t: grace_secs };

        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    RuntimeError::ContainerNotFound { id: id.to_string() }
                } else {
                    RuntimeError::StopFailed(e.to_string())
                }
            })
    }

    /// Removes a container by id or name.
    pub async fn remove_by_id(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    RuntimeError::ContainerNotFound { id: id.to_string() }
                } else {
                    RuntimeError::RemoveFailed(e.to_string())
                }
            })
    }

    /// Lists containers, stopped ones included, whose name contains `name`.
    pub async fn list_by_name(&self, name: &str) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);

        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::ListFailed(e.to_string()))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let name = c
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|n| n.trim_start_matches('/').to_string())?;
                Some(ContainerSummary {
                    id: c.id.unwrap_or_default(),
                    name,
                    state: c.state.unwrap_or_default(),
                })
            })
            .collect())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        if self.image_exists(image).await {
            debug!(image = image, "Image present locally, skipping pull");
            return Ok(());
        }

        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            result.map_err(|e| RuntimeError::PullFailed {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        let host_config = HostConfig {
            network_mode: spec.network.clone(),
            binds: if spec.volumes.is_empty() {
                None
            } else {
                Some(spec.volumes.clone())
            },
            ..Default::default()
        };

        // No TTY so the log stream stays multiplexed and stdout can be split from stderr
        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd: spec.cmd.clone(),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            host_config: Some(host_config),
            tty: Some(false),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| RuntimeError::CreateFailed(e.to_string()))?;

        Ok(ContainerHandle {
            id: response.id,
            name: spec.name.clone(),
        })
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.docker
            .start_container(&handle.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::StartFailed(e.to_string()))
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(&handle.id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(RuntimeError::WaitFailed(e.to_string())),
            None => Err(RuntimeError::WaitFailed(
                "Wait stream ended without a status".to_string(),
            )),
        }
    }

    async fn stdout(&self, handle: &ContainerHandle) -> Result<String, RuntimeError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: false,
            follow: false,
            timestamps: false,
            ..Default::default()
        };

        let mut logs = self.docker.logs(&handle.id, Some(options));
        let mut output = Vec::new();

        while let Some(chunk) = logs.next().await {
            let frame = chunk.map_err(|e| RuntimeError::LogsFailed(e.to_string()))?;
            append_stdout(&mut output, frame);
        }

        // Frames can split a multi-byte character, so decode only once
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    async fn remove(&self, handle: &ContainerHandle, force: bool) -> Result<(), RuntimeError> {
        self.remove_by_id(&handle.id, force).await
    }
}

/// Appends the payload of a stdout frame; other streams are ignored.
fn append_stdout(buf: &mut Vec<u8>, frame: LogOutput) {
    if let LogOutput::StdOut { message } = frame {
        buf.extend_from_slice(&message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_character_split_across_frames_survives() {
        let frames = vec![
            LogOutput::StdOut {
                message: b"caf\xc3".to_vec().into(),
            },
            LogOutput::StdErr {
                message: b"warning\n".to_vec().into(),
            },
            LogOutput::StdOut {
                message: b"\xa9\n".to_vec().into(),
            },
        ];

        let mut output = Vec::new();
        for frame in frames {
            append_stdout(&mut output, frame);
        }

        assert_eq!(String::from_utf8_lossy(&output), "café\n");
    }
}
