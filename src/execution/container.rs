//! Lifecycle of one execution's container.
//!
//! ```text
//! Created → Started → Waiting → Exited | WaitFailed | TimedOut → Removed
//! ```
//!
//! [`ContainerRun::remove`] consumes the run, so a container can be torn
//! down at most once; the executor calls it on every path after creation.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::RuntimeError;
use crate::execution::runtime::{ContainerHandle, ContainerRuntime, ContainerSpec};

/// State of a managed container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Created,
    Started,
    Waiting,
    Exited { code: i64 },
    WaitFailed,
    TimedOut,
    Removed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Created => write!(f, "created"),
            RunState::Started => write!(f, "started"),
            RunState::Waiting => write!(f, "waiting"),
            RunState::Exited { code } => write!(f, "exited({})", code),
            RunState::WaitFailed => write!(f, "wait_failed"),
            RunState::TimedOut => write!(f, "timed_out"),
            RunState::Removed => write!(f, "removed"),
        }
    }
}

/// How a bounded wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(i64),
    TimedOut,
}

/// A created container and the state it has reached.
pub struct ContainerRun<'a> {
    runtime: &'a dyn ContainerRuntime,
    handle: ContainerHandle,
    state: RunState,
}

impl<'a> ContainerRun<'a> {
    /// Creates the container. Nothing needs tearing down if this fails.
    pub async fn create(
        runtime: &'a dyn ContainerRuntime,
        spec: &ContainerSpec,
    ) -> Result<ContainerRun<'a>, RuntimeError> {
        let handle = runtime.create(spec).await?;
        debug!(container_id = %handle.id, name = %handle.name, "Container created");

        Ok(Self {
            runtime,
            handle,
            state: RunState::Created,
        })
    }

    pub fn handle(&self) -> &ContainerHandle {
        &self.handle
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub async fn start(&mut self) -> Result<(), RuntimeError> {
        if self.state != RunState::Created {
            return Err(RuntimeError::StartFailed(format!(
                "Cannot start container in {} state",
                self.state
            )));
        }

        self.runtime.start(&self.handle).await?;
        self.state = RunState::Started;
        Ok(())
    }

    /// Waits for the container to stop, giving up after `timeout`.
    ///
    /// The timeout is measured from the call, not from container start.
    pub async fn wait(&mut self, timeout: Duration) -> Result<WaitOutcome, RuntimeError> {
        if self.state != RunState::Started {
            return Err(RuntimeError::WaitFailed(format!(
                "Cannot wait on container in {} state",
                self.state
            )));
        }

        self.state = RunState::Waiting;

        match tokio::time::timeout(timeout, self.runtime.wait(&self.handle)).await {
            Ok(Ok(code)) => {
                self.state = RunState::Exited { code };
                Ok(WaitOutcome::Exited(code))
            }
            Ok(Err(e)) => {
                self.state = RunState::WaitFailed;
                Err(e)
            }
            Err(_) => {
                self.state = RunState::TimedOut;
                Ok(WaitOutcome::TimedOut)
            }
        }
    }

    /// Reads the container's stdout. Only valid once it has exited.
    pub async fn stdout(&self) -> Result<String, RuntimeError> {
        if !matches!(self.state, RunState::Exited { .. }) {
            return Err(RuntimeError::LogsFailed(format!(
                "Cannot read logs of container in {} state",
                self.state
            )));
        }

        self.runtime.stdout(&self.handle).await
    }

    /// Force-removes the container. Failures are logged and swallowed.
    pub async fn remove(mut self) -> RunState {
        let last = self.state;

        if let Err(e) = self.runtime.remove(&self.handle, true).await {
            warn!(
                container_id = %self.handle.id,
                last_state = %last,
                error = %e,
                "Failed to remove container"
            );
        }

        self.state = RunState::Removed;
        debug!(container_id = %self.handle.id, last_state = %last, "Container removed");
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct StubRuntime {
        hang: bool,
        removes: AtomicUsize,
    }

    #[async_trait]
    impl ContainerRuntime for StubRuntime {
        async fn pull(&self, _image: &str) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
            Ok(ContainerHandle {
                id: "c-1".to_string(),
                name: spec.name.clone(),
            })
        }

        async fn start(&self, _handle: &ContainerHandle) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn wait(&self, _handle: &ContainerHandle) -> Result<i64, RuntimeError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(0)
        }

        async fn stdout(&self, _handle: &ContainerHandle) -> Result<String, RuntimeError> {
            Ok("out".to_string())
        }

        async fn remove(&self, _handle: &ContainerHandle, force: bool) -> Result<(), RuntimeError> {
            assert!(force);
            self.removes.fetch_add(1, Ordering::SeqCst);
            Err(RuntimeError::RemoveFailed("busy".to_string()))
        }
    }

    #[tokio::test]
    async fn test_happy_lifecycle() {
        let runtime = StubRuntime::default();
        let spec = ContainerSpec::new("faas-e-1", "img");

        let mut run = ContainerRun::create(&runtime, &spec).await.expect("create");
        assert_eq!(run.state(), RunState::Created);

        run.start().await.expect("start");
        let outcome = run.wait(Duration::from_secs(1)).await.expect("wait");
        assert_eq!(outcome, WaitOutcome::Exited(0));
        assert_eq!(run.stdout().await.expect("logs"), "out");

        assert_eq!(run.remove().await, RunState::Exited { code: 0 });
        assert_eq!(runtime.removes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_illegal_transitions_rejected() {
        let runtime = StubRuntime::default();
        let spec = ContainerSpec::new("faas-e-1", "img");
        let mut run = ContainerRun::create(&runtime, &spec).await.expect("create");

        assert!(run.wait(Duration::from_secs(1)).await.is_err());
        assert!(run.stdout().await.is_err());

        run.start().await.expect("start");
        assert!(run.start().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let runtime = StubRuntime {
            hang: true,
            ..Default::default()
        };
        let spec = ContainerSpec::new("faas-e-1", "img");
        let mut run = ContainerRun::create(&runtime, &spec).await.expect("create");
        run.start().await.expect("start");

        let outcome = run.wait(Duration::from_secs(300)).await.expect("wait");
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert_eq!(run.state(), RunState::TimedOut);
        assert!(run.stdout().await.is_err());

        assert_eq!(run.remove().await, RunState::TimedOut);
        assert_eq!(runtime.removes.load(Ordering::SeqCst), 1);
    }
}
