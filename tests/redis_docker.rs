//! Integration tests against a live Redis and Docker daemon.
//!
//! Run with: REDIS_URL=redis://localhost:6379 cargo test --test redis_docker -- --ignored

use std::sync::Arc;
use std::time::Duration;

use faas_runtime::error::StoreError;
use faas_runtime::execution::{
    ContainerExecutor, DockerRuntime, ExecutorConfig, FunctionExecutor,
};
use faas_runtime::model::{Execution, Function};
use faas_runtime::queue::{QueueSettings, RedisStreamQueue, RetryPolicy, WorkQueue};
use faas_runtime::store::{ExecutionStore, MemoryCatalog, RedisStore};
use redis::aio::ConnectionManager;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

/// Settings on a throwaway stream so runs don't interfere.
fn scratch_settings() -> QueueSettings {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    QueueSettings {
        subject: format!("test.executions.{}", &suffix[..8]),
        group: "test-workers".to_string(),
        ack_wait: Duration::from_secs(2),
        max_deliver: 2,
    }
}

async fn queue(settings: QueueSettings) -> RedisStreamQueue {
    RedisStreamQueue::connect(
        &redis_url(),
        settings,
        &RetryPolicy::new(Duration::from_millis(100), 3),
    )
    .await
    .expect("Redis must be reachable for integration tests")
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_docker -- --ignored
async fn test_stream_roundtrip_and_ack() {
    let queue = queue(scratch_settings()).await;
    let execution = Execution::new("fn", "alice", "{}");

    queue.enqueue(&execution).await.expect("enqueue");
    assert_eq!(queue.pending_count().await.expect("count"), 1);

    let delivery = queue
        .fetch("w-1", Duration::from_secs(1))
        .await
        .expect("fetch")
        .expect("message");
    assert_eq!(delivery.execution().expect("decode").id, execution.id);
    assert_eq!(delivery.delivery_count, 1);

    queue.ack(&delivery).await.expect("ack");
    assert_eq!(queue.pending_count().await.expect("count"), 0);
}

#[tokio::test]
#[ignore]
async fn test_nak_redelivers_then_dead_letters() {
    let queue = queue(scratch_settings()).await;
    queue
        .enqueue(&Execution::new("fn", "alice", ""))
        .await
        .expect("enqueue");

    let first = queue
        .fetch("w-1", Duration::from_secs(1))
        .await
        .expect("fetch")
        .expect("message");
    queue.nak(&first).await.expect("nak");

    let second = queue
        .fetch("w-2", Duration::from_secs(1))
        .await
        .expect("fetch")
        .expect("redelivered");
    assert_eq!(second.message_id, first.message_id);
    assert_eq!(second.delivery_count, 2);
    queue.nak(&second).await.expect("nak");

    // Two deliveries used up: the next fetch moves it aside
    let third = queue.fetch("w-3", Duration::from_millis(200)).await.expect("fetch");
    assert!(third.is_none());

    let stats = queue.stats().await.expect("stats");
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.dead_lettered, 1);
}

#[tokio::test]
#[ignore]
async fn test_nak_redelivers_behind_many_in_flight_messages() {
    let queue = queue(scratch_settings()).await;
    for _ in 0..17 {
        queue
            .enqueue(&Execution::new("fn", "alice", ""))
            .await
            .expect("enqueue");
    }

    // Sixteen long-running executions hold the oldest pending entries
    for _ in 0..16 {
        queue
            .fetch("busy", Duration::from_secs(1))
            .await
            .expect("fetch")
            .expect("message");
    }

    let newest = queue
        .fetch("w-1", Duration::from_secs(1))
        .await
        .expect("fetch")
        .expect("message");
    queue.nak(&newest).await.expect("nak");

    let again = queue
        .fetch("w-2", Duration::from_millis(200))
        .await
        .expect("fetch")
        .expect("nak'd entry is redelivered at once");
    assert_eq!(again.message_id, newest.message_id);
    assert_eq!(again.delivery_count, 2);
}

#[tokio::test]
#[ignore]
async fn test_unacked_message_redelivered_after_ack_wait() {
    let queue = queue(scratch_settings()).await;
    queue
        .enqueue(&Execution::new("fn", "alice", ""))
        .await
        .expect("enqueue");

    let first = queue
        .fetch("w-1", Duration::from_secs(1))
        .await
        .expect("fetch")
        .expect("message");

    assert!(queue
        .fetch("w-2", Duration::from_millis(200))
        .await
        .expect("fetch")
        .is_none());

    tokio::time::sleep(Duration::from_secs(3)).await;

    let again = queue
        .fetch("w-2", Duration::from_secs(1))
        .await
        .expect("fetch")
        .expect("reclaimed");
    assert_eq!(again.message_id, first.message_id);
    assert!(again.is_redelivery());
    queue.ack(&again).await.expect("ack");
}

#[tokio::test]
#[ignore]
async fn test_redis_store_compare_and_put() {
    let client = redis::Client::open(redis_url()).expect("url");
    let conn = ConnectionManager::new(client).await.expect("connect");
    let prefix = format!("test-{}", uuid::Uuid::new_v4().simple());
    let store = RedisStore::new(conn, prefix);

    let execution = Execution::new("fn", "alice", "");
    let written = store.compare_and_put(&execution).await.expect("first write");
    assert_eq!(written.version, 1);

    // A writer holding the stale version loses
    let stale = store.compare_and_put(&execution).await;
    assert!(matches!(
        stale,
        Err(StoreError::VersionConflict {
            expected: 0,
            actual: 1,
            ..
        })
    ));

    let fetched = store.get(&execution.id).await.expect("get");
    assert_eq!(fetched.version, 1);

    store.delete(&execution.id).await.expect("delete");
    assert!(store.get(&execution.id).await.expect_err("gone").is_not_found());
}

#[tokio::test]
#[ignore] // Requires a Docker daemon and network access to pull alpine
async fn test_docker_executor_runs_container() {
    let runtime = DockerRuntime::new().expect("Docker must be available");
    let catalog = Arc::new(MemoryCatalog::new());
    catalog
        .insert_function(Function::new("echo", "alice", "alpine:3.19"))
        .await;

    let executor = ContainerExecutor::new(
        Arc::new(runtime),
        catalog.clone(),
        catalog,
        ExecutorConfig::default()
            .with_timeout(Duration::from_secs(60))
            .with_network("bridge"),
    );

    // alpine's default command is a shell; the input becomes its argument
    let execution = Execution::new("echo", "alice", "");
    let output = executor.execute(&execution).await.expect("execute");
    assert!(output.stdout.is_empty());
}
