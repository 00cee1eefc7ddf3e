//! Queue-depth autoscaler for the worker fleet.
//!
//! Every `check_interval` the loop reads the queue's pending count and the
//! replica count and computes messages per worker:
//!
//! - above `scale_up_threshold` and below `max_workers`: add `step` workers
//! - below `scale_down_threshold` and above `min_workers`: remove `step`
//! - a replica count outside `[min, max]` is moved back to the bound
//!
//! One shared cooldown separates any two scale actions, whatever their
//! direction. The decision itself is the pure [`Autoscaler::evaluate`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use super::scaler::WorkerScaler;
use crate::error::ScalingError;
use crate::metrics::MetricsCollector;
use crate::queue::WorkQueue;

/// Direction of a scaling operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDirection {
    Up,
    Down,
}

impl std::fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// A scaling decision emitted by the autoscaler.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleDecision {
    pub direction: ScaleDirection,
    /// Replica count observed.
    pub current: usize,
    /// Replica count to reach.
    pub desired: usize,
    /// Human-readable reason for the decision.
    pub reason: String,
}

/// Inputs of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingSnapshot {
    /// Unacknowledged queue messages.
    pub pending: usize,
    /// Running worker replicas.
    pub workers: usize,
}

impl ScalingSnapshot {
    /// Pending messages per worker; with no workers, the raw pending count.
    pub fn messages_per_worker(&self) -> f64 {
        self.pending as f64 / self.workers.max(1) as f64
    }
}

/// Thresholds and timing of the control loop.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoscalerConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub step: usize,
    pub check_interval: Duration,
    pub cooldown: Duration,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 10,
            scale_up_threshold: 3.0,
            scale_down_threshold: 2.0,
            step: 1,
            check_interval: Duration::from_secs(30),
            cooldown: Duration::from_secs(30),
        }
    }
}

impl AutoscalerConfig {
    pub fn with_bounds(mut self, min_workers: usize, max_workers: usize) -> Self {
        self.min_workers = min_workers;
        self.max_workers = max_workers;
        self
    }

    pub fn with_thresholds(mut self, up: f64, down: f64) -> Self {
        self.scale_up_threshold = up;
        self.scale_down_threshold = down;
        self
    }

    pub fn with_step(mut self, step: usize) -> Self {
        self.step = step;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// Owns all mutable scaling state: there is no process-wide state, so
/// several instances can run side by side.
pub struct Autoscaler {
    config: AutoscalerConfig,
    queue: Arc<dyn WorkQueue>,
    scaler: WorkerScaler,
    last_scale: Option<Instant>,
    metrics: MetricsCollector,
}

impl Autoscaler {
    pub fn new(config: AutoscalerConfig, queue: Arc<dyn WorkQueue>, scaler: WorkerScaler) -> Self {
        Self {
            config,
            queue,
            scaler,
            last_scale: None,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn config(&self) -> &AutoscalerConfig {
        &self.config
    }

    /// When the last scale action was issued.
    pub fn last_scale(&self) -> Option<Instant> {
        self.last_scale
    }

    /// Whether the cooldown has elapsed at `now`.
    pub fn cooled_down(&self, now: Instant) -> bool {
        self.last_scale
            .map_or(true, |at| now.saturating_duration_since(at) >= self.config.cooldown)
    }

    /// Decides what to do for `snapshot` at `now`. Performs no I/O and does
    /// not record anything.
    pub fn evaluate(&self, snapshot: ScalingSnapshot, now: Instant) -> Option<ScaleDecision> {
        if !self.cooled_down(now) {
            return None;
        }

        let cfg = &self.config;
        let workers = snapshot.workers;
        let ratio = snapshot.messages_per_worker();

        let (direction, desired, reason) = if workers < cfg.min_workers {
            (
                ScaleDirection::Up,
                cfg.min_workers,
                format!("{} workers below minimum {}", workers, cfg.min_workers),
            )
        } else if workers > cfg.max_workers {
            (
                ScaleDirection::Down,
                cfg.max_workers,
                format!("{} workers above maximum {}", workers, cfg.max_workers),
            )
        } else if ratio > cfg.scale_up_threshold && workers < cfg.max_workers {
            (
                ScaleDirection::Up,
                (workers + cfg.step).min(cfg.max_workers),
                format!(
                    "{:.2} messages per worker > {}",
                    ratio, cfg.scale_up_threshold
                ),
            )
        } else if ratio < cfg.scale_down_threshold && workers > cfg.min_workers {
            (
                ScaleDirection::Down,
                workers.saturating_sub(cfg.step).max(cfg.min_workers),
                format!(
                    "{:.2} messages per worker < {}",
                    ratio, cfg.scale_down_threshold
                ),
            )
        } else {
            return None;
        };

        Some(ScaleDecision {
            direction,
            current: workers,
            desired,
            reason,
        })
    }

    /// Runs one evaluation including its I/O.
    ///
    /// The cooldown starts when a scale command is issued, whether or not
    /// the command then succeeds.
    pub async fn tick(&mut self) -> Result<Option<ScaleDecision>, ScalingError> {
        let pending = self.queue.pending_count().await?;
        let workers = self.scaler.current_workers().await?;
        let snapshot = ScalingSnapshot { pending, workers };

        self.metrics.set_queue_depth(pending);
        self.metrics.set_worker_replicas(workers);

        info!(
            pending = pending,
            workers = workers,
            messages_per_worker = snapshot.messages_per_worker(),
            "Status check"
        );

        let now = Instant::now();
        let Some(decision) = self.evaluate(snapshot, now) else {
            debug!(cooled_down = self.cooled_down(now), "No scaling needed");
            return Ok(None);
        };

        info!(
            direction = %decision.direction,
            from = decision.current,
            to = decision.desired,
            reason = %decision.reason,
            "Autoscaler decision"
        );

        self.last_scale = Some(now);
        self.metrics.record_scale_action(&decision.direction.to_string());
        self.scaler.apply(&decision).await?;

        Ok(Some(decision))
    }

    /// Evaluates every `check_interval` until shutdown is signalled.
    ///
    /// Ticks never overlap; a slow scale command delays the next tick.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.check_interval;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            service = %self.scaler.service(),
            min_workers = self.config.min_workers,
            max_workers = self.config.max_workers,
            check_interval_secs = period.as_secs(),
            cooldown_secs = self.config.cooldown.as_secs(),
            "Autoscaler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Scaling check failed");
                    }
                }
            }
        }

        info!("Autoscaler stopped");
    }
}
