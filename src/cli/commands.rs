//! CLI command definitions for the faas binary.
//!
//! `worker` and `autoscaler` are the long-running processes of the
//! pipeline; `submit`, `status` and `list` exercise the submission path.

use crate::config::{AutoscalerArgs, SubmissionArgs, WorkerArgs};
use crate::execution::{ContainerExecutor, DockerRuntime};
use crate::metrics::{export_metrics, init_metrics};
use crate::model::Execution;
use crate::queue::{RedisStreamQueue, RetryPolicy};
use crate::scaling::{Autoscaler, DockerReplicaBackend, ReplicaTemplate, WorkerScaler};
use crate::shutdown;
use crate::store::RedisStore;
use crate::submission::SubmissionService;
use crate::worker::{ExecutionProcessor, WorkerPool, WorkerPoolConfig};
use clap::Parser;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Namespace of the record store buckets in Redis.
const STORE_PREFIX: &str = "faas";

/// Function execution pipeline.
#[derive(Parser)]
#[command(name = "faas")]
#[command(about = "Run function executions in containers from a durable queue")]
#[command(version)]
#[command(
    long_about = "faas runs the execution pipeline of the function platform.\n\nAll settings are read from the environment; flags override them.\n\nExample usage:\n  faas worker\n  faas autoscaler\n  faas submit --function hello --user alice --input '{\"name\":\"x\"}'"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Consume the execution queue and run functions in containers.
    Worker(WorkerArgs),

    /// Size the worker fleet against queue depth.
    Autoscaler(AutoscalerArgs),

    /// Submit one execution.
    Submit(SubmitArgs),

    /// Show one execution.
    Status(StatusArgs),

    /// List a user's executions.
    #[command(alias = "ls")]
    List(ListArgs),
}

/// Arguments for `faas submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Function to invoke.
    #[arg(short, long)]
    pub function: String,

    /// Calling user.
    #[arg(short, long)]
    pub user: String,

    /// Input payload, usually JSON.
    #[arg(short, long, default_value = "")]
    pub input: String,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,

    #[command(flatten)]
    pub submission: SubmissionArgs,
}

/// Arguments for `faas status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Execution id.
    pub id: String,

    /// Calling user.
    #[arg(short, long)]
    pub user: String,

    #[command(flatten)]
    pub submission: SubmissionArgs,
}

/// Arguments for `faas list`.
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Calling user.
    #[arg(short, long)]
    pub user: String,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,

    #[command(flatten)]
    pub submission: SubmissionArgs,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Worker(args) => run_worker_command(args).await,
        Commands::Autoscaler(args) => run_autoscaler_command(args).await,
        Commands::Submit(args) => run_submit_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
        Commands::List(args) => run_list_command(args).await,
    }
}

// ============================================================================
// Long-running processes
// ============================================================================

async fn run_worker_command(args: WorkerArgs) -> anyhow::Result<()> {
    args.validate()?;
    init_metrics()?;

    let settings = args.broker.queue_settings();
    let queue = Arc::new(
        RedisStreamQueue::connect(&args.broker.broker_url, settings, &RetryPolicy::default())
            .await?,
    );
    let store = Arc::new(connect_store(&args.broker.broker_url).await?);

    let runtime = DockerRuntime::new()?;
    let executor = ContainerExecutor::new(
        Arc::new(runtime),
        store.clone(),
        store.clone(),
        args.executor.executor_config(),
    );
    let processor = Arc::new(ExecutionProcessor::new(store, Arc::new(executor)));

    let mut pool = WorkerPool::new(
        WorkerPoolConfig::new(args.worker_concurrency),
        queue.clone(),
        processor,
    );

    let shutdown_tx = shutdown::install();
    let mut shutdown_rx = shutdown_tx.subscribe();

    pool.start()?;
    info!(
        consumers = pool.num_workers(),
        timeout_secs = args.executor.execution_timeout.as_secs(),
        "Worker running"
    );

    // A closed channel means the signal task is gone; stop either way
    let _ = shutdown_rx.recv().await;

    if let Err(e) = pool.shutdown().await {
        warn!(error = %e, "Worker pool did not stop cleanly");
    }

    let stats = pool.stats();
    info!(
        completed = stats.executions_completed,
        failed = stats.executions_failed,
        duplicates = stats.duplicates,
        redeliveries = stats.redeliveries,
        success_rate = stats.success_rate(),
        "Worker stopped"
    );
    match queue.stats().await {
        Ok(queue_stats) => info!(
            pending = queue_stats.pending,
            dead_lettered = queue_stats.dead_lettered,
            "Queue state at shutdown"
        ),
        Err(e) => warn!(error = %e, "Could not read queue state"),
    }
    debug!(metrics = %export_metrics(), "Final metrics");

    Ok(())
}

async fn run_autoscaler_command(args: AutoscalerArgs) -> anyhow::Result<()> {
    args.validate()?;
    init_metrics()?;

    let settings = args.broker.queue_settings();
    let queue =
        RedisStreamQueue::connect(&args.broker.broker_url, settings, &RetryPolicy::default())
            .await?;

    let template = ReplicaTemplate::new(&args.worker_image, &args.network_name)
        .with_env(vec![format!("BROKER_URL={}", args.broker.broker_url)]);
    let backend = DockerReplicaBackend::new(DockerRuntime::new()?, template);
    let scaler = WorkerScaler::new(Arc::new(backend), &args.worker_service);

    let autoscaler = Autoscaler::new(args.autoscaler_config(), Arc::new(queue), scaler);

    let shutdown_tx = shutdown::install();
    autoscaler.run(shutdown_tx.subscribe()).await;

    debug!(metrics = %export_metrics(), "Final metrics");
    Ok(())
}

// ============================================================================
// Submission commands
// ============================================================================

async fn run_submit_command(args: SubmitArgs) -> anyhow::Result<()> {
    let service = build_submission_service(&args.submission).await?;

    let execution = service
        .create_execution(&args.function, &args.user, &args.input)
        .await
        .map_err(|e| anyhow::anyhow!("[{}] {}", e.reason_code(), e))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
    } else {
        println!("Submitted execution {}", execution.id);
        println!("  status: {}", execution.status);
    }

    Ok(())
}

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let service = build_submission_service(&args.submission).await?;

    let execution = service
        .get_execution(&args.id, &args.user)
        .await
        .map_err(|e| anyhow::anyhow!("[{}] {}", e.reason_code(), e))?;

    println!("{}", serde_json::to_string_pretty(&execution)?);
    Ok(())
}

async fn run_list_command(args: ListArgs) -> anyhow::Result<()> {
    let service = build_submission_service(&args.submission).await?;

    let executions = service
        .list_executions(&args.user)
        .await
        .map_err(|e| anyhow::anyhow!("[{}] {}", e.reason_code(), e))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&executions)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!("No executions for {}", args.user);
        return Ok(());
    }

    for execution in &executions {
        println!("{}", summary_line(execution));
    }

    Ok(())
}

async fn build_submission_service(args: &SubmissionArgs) -> anyhow::Result<SubmissionService> {
    args.validate()?;

    let queue = RedisStreamQueue::connect(
        &args.broker.broker_url,
        args.broker.queue_settings(),
        &RetryPolicy::default(),
    )
    .await?;
    let store = Arc::new(connect_store(&args.broker.broker_url).await?);

    Ok(
        SubmissionService::new(store.clone(), store, Arc::new(queue))
            .with_max_concurrent(args.max_concurrent_executions),
    )
}

async fn connect_store(broker_url: &str) -> anyhow::Result<RedisStore> {
    let client = redis::Client::open(broker_url)?;
    let conn = ConnectionManager::new(client).await?;
    Ok(RedisStore::new(conn, STORE_PREFIX))
}

fn summary_line(execution: &Execution) -> String {
    let mut line = format!(
        "{}  {:<9}  {}  {}",
        execution.id,
        execution.status,
        execution.function_id,
        execution.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    if !execution.error.is_empty() {
        line.push_str(&format!("  ({})", execution.error));
    }
    line
}
