//! Worker fleet autoscaling.
//!
//! The [`Autoscaler`] watches queue depth against the replica count and
//! drives a [`WorkerScaler`], which turns decisions into
//! [`ReplicaBackend`] calls.

pub mod autoscaler;
pub mod backend;
pub mod scaler;

pub use autoscaler::{
    Autoscaler, AutoscalerConfig, ScaleDecision, ScaleDirection, ScalingSnapshot,
};
pub use backend::{
    replica_name, replica_ordinal, DockerReplicaBackend, ReplicaBackend, ReplicaTemplate,
    REPLICA_BASE_INDEX, STOP_GRACE_SECS,
};
pub use scaler::WorkerScaler;
