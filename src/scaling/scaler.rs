//! Turns scale decisions into replica backend calls.

use std::sync::Arc;

use tracing::{info, warn};

use super::autoscaler::{ScaleDecision, ScaleDirection};
use super::backend::ReplicaBackend;
use crate::error::RuntimeError;

/// Scales one worker service.
pub struct WorkerScaler {
    backend: Arc<dyn ReplicaBackend>,
    service: String,
}

impl WorkerScaler {
    pub fn new(backend: Arc<dyn ReplicaBackend>, service: impl Into<String>) -> Self {
        Self {
            backend,
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub async fn current_workers(&self) -> Result<usize, RuntimeError> {
        self.backend.count_replicas(&self.service).await
    }

    /// Moves the service from `decision.current` to `decision.desired`.
    ///
    /// Scaling down stops the highest-numbered replicas that actually exist,
    /// so gaps left by replicas removed out of band are skipped.
    pub async fn apply(&self, decision: &ScaleDecision) -> Result<(), RuntimeError> {
        info!(
            service = %self.service,
            direction = %decision.direction,
            from = decision.current,
            to = decision.desired,
            "Scaling workers"
        );

        match decision.direction {
            ScaleDirection::Up => {
                let count = decision.desired.saturating_sub(decision.current);
                self.backend.run_replicas(&self.service, count).await
            }
            ScaleDirection::Down => {
                let replicas = self.backend.list_replicas(&self.service).await?;
                let excess = replicas.len().saturating_sub(decision.desired);

                for name in replicas.iter().rev().take(excess) {
                    match self.backend.stop_replica(name).await {
                        Ok(()) => {}
                        Err(RuntimeError::ContainerNotFound { .. }) => {
                            warn!(replica = %name, "Replica already gone");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
        }
    }
}
