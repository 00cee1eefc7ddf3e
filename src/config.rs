//! Environment-sourced configuration.
//!
//! Every setting can be given as a flag or through its environment
//! variable; deployments normally only set the environment. Groups are
//! flattened into the subcommands that need them.

use std::time::Duration;

use clap::Args;
use thiserror::Error;

use crate::execution::{ExecutorConfig, DEFAULT_API_BASE_URL, DEFAULT_NETWORK};
use crate::queue::{QueueSettings, DEFAULT_MAX_DELIVER, EXECUTIONS_SUBJECT, WORKERS_GROUP};
use crate::scaling::AutoscalerConfig;
use crate::submission::DEFAULT_MAX_CONCURRENT;

/// Default broker location.
pub const DEFAULT_BROKER_URL: &str = "redis://localhost:6379";

/// Rejected configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

/// Parses `500ms`, `30s`, `5m`, `1h` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{}'", raw))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(format!("unknown duration unit '{}' in '{}'", other, raw)),
    }
}

/// Broker connection and queue wiring.
#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Redis URL of the work queue and record store.
    #[arg(long, env = "BROKER_URL", default_value = DEFAULT_BROKER_URL)]
    pub broker_url: String,

    /// Stream subject carrying pending executions.
    #[arg(long, env = "QUEUE_SUBJECT", default_value = EXECUTIONS_SUBJECT)]
    pub queue_subject: String,

    /// Delivery group shared by all workers.
    #[arg(long, env = "CONSUMER_GROUP", default_value = WORKERS_GROUP)]
    pub consumer_group: String,

    /// Deliveries before a message is dead-lettered.
    #[arg(long, env = "MAX_DELIVER", default_value_t = DEFAULT_MAX_DELIVER)]
    pub max_deliver: u32,

    /// How long a delivered message may stay unacknowledged.
    #[arg(long, env = "ACK_WAIT", default_value = "6m", value_parser = parse_duration)]
    pub ack_wait: Duration,
}

impl BrokerArgs {
    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            subject: self.queue_subject.clone(),
            group: self.consumer_group.clone(),
            ack_wait: self.ack_wait,
            max_deliver: self.max_deliver,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_deliver < 1 {
            return Err(invalid("MAX_DELIVER must be at least 1"));
        }
        if self.ack_wait.is_zero() {
            return Err(invalid("ACK_WAIT must be positive"));
        }
        Ok(())
    }
}

/// Container executor settings.
#[derive(Args, Debug, Clone)]
pub struct ExecutorArgs {
    /// Wall-clock limit of one function run.
    #[arg(long, env = "EXECUTION_TIMEOUT", default_value = "5m", value_parser = parse_duration)]
    pub execution_timeout: Duration,

    /// Object API base URL handed to function containers.
    #[arg(long, env = "API_BASE_URL", default_value = DEFAULT_API_BASE_URL)]
    pub api_base_url: String,

    /// Network function containers join.
    #[arg(long, env = "NETWORK_NAME", default_value = DEFAULT_NETWORK)]
    pub network_name: String,
}

impl ExecutorArgs {
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::default()
            .with_timeout(self.execution_timeout)
            .with_network(&self.network_name)
            .with_api_base_url(&self.api_base_url)
    }
}

/// Settings of `faas worker`.
#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,

    #[command(flatten)]
    pub executor: ExecutorArgs,

    /// Consumers run by this process.
    #[arg(long, env = "WORKER_CONCURRENCY", default_value_t = 1)]
    pub worker_concurrency: usize,
}

impl WorkerArgs {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;
        if self.executor.execution_timeout.is_zero() {
            return Err(invalid("EXECUTION_TIMEOUT must be positive"));
        }
        if self.broker.ack_wait <= self.executor.execution_timeout {
            return Err(invalid(format!(
                "ACK_WAIT ({}s) must exceed EXECUTION_TIMEOUT ({}s)",
                self.broker.ack_wait.as_secs(),
                self.executor.execution_timeout.as_secs()
            )));
        }
        if self.worker_concurrency < 1 {
            return Err(invalid("WORKER_CONCURRENCY must be at least 1"));
        }
        Ok(())
    }
}

/// Settings of `faas autoscaler`.
#[derive(Args, Debug, Clone)]
pub struct AutoscalerArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,

    #[arg(long, env = "MIN_WORKERS", default_value_t = 2)]
    pub min_workers: usize,

    #[arg(long, env = "MAX_WORKERS", default_value_t = 10)]
    pub max_workers: usize,

    /// Messages per worker above which the fleet grows.
    #[arg(long, env = "SCALE_UP_THRESHOLD", default_value_t = 3.0)]
    pub scale_up_threshold: f64,

    /// Messages per worker below which the fleet shrinks.
    #[arg(long, env = "SCALE_DOWN_THRESHOLD", default_value_t = 2.0)]
    pub scale_down_threshold: f64,

    /// Replicas added or removed per action.
    #[arg(long, env = "SCALE_STEP", default_value_t = 1)]
    pub scale_step: usize,

    #[arg(long, env = "CHECK_INTERVAL", default_value = "30s", value_parser = parse_duration)]
    pub check_interval: Duration,

    /// Minimum time between two scale actions.
    #[arg(long, env = "COOLDOWN_PERIOD", default_value = "30s", value_parser = parse_duration)]
    pub cooldown_period: Duration,

    /// Service name; replicas are `<service>-100`, `<service>-101`, ...
    #[arg(long, env = "WORKER_SERVICE", default_value = "worker")]
    pub worker_service: String,

    #[arg(long, env = "WORKER_IMAGE", default_value = "faas-worker:latest")]
    pub worker_image: String,

    /// Network worker replicas join.
    #[arg(long, env = "NETWORK_NAME", default_value = DEFAULT_NETWORK)]
    pub network_name: String,
}

impl AutoscalerArgs {
    pub fn autoscaler_config(&self) -> AutoscalerConfig {
        AutoscalerConfig::default()
            .with_bounds(self.min_workers, self.max_workers)
            .with_thresholds(self.scale_up_threshold, self.scale_down_threshold)
            .with_step(self.scale_step)
            .with_check_interval(self.check_interval)
            .with_cooldown(self.cooldown_period)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;
        if self.min_workers < 1 {
            return Err(invalid("MIN_WORKERS must be at least 1"));
        }
        if self.max_workers < self.min_workers {
            return Err(invalid(format!(
                "MAX_WORKERS ({}) must not be below MIN_WORKERS ({})",
                self.max_workers, self.min_workers
            )));
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(invalid(format!(
                "SCALE_DOWN_THRESHOLD ({}) must be below SCALE_UP_THRESHOLD ({})",
                self.scale_down_threshold, self.scale_up_threshold
            )));
        }
        if self.scale_step < 1 {
            return Err(invalid("SCALE_STEP must be at least 1"));
        }
        if self.check_interval.is_zero() || self.cooldown_period.is_zero() {
            return Err(invalid("CHECK_INTERVAL and COOLDOWN_PERIOD must be positive"));
        }
        Ok(())
    }
}

/// Settings of the submission commands.
#[derive(Args, Debug, Clone)]
pub struct SubmissionArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Per-user cap on Pending + Running executions.
    #[arg(long, env = "MAX_CONCURRENT_EXECUTIONS", default_value_t = DEFAULT_MAX_CONCURRENT)]
    pub max_concurrent_executions: usize,
}

impl SubmissionArgs {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;
        if self.max_concurrent_executions < 1 {
            return Err(invalid("MAX_CONCURRENT_EXECUTIONS must be at least 1"));
        }
        Ok(())
    }
}
