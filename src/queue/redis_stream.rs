//! Redis Streams implementation of [`WorkQueue`].
//!
//! # Key layout
//!
//! - `{subject}`: the stream; each entry has a single `payload` field
//! - `{subject}.dead`: dead-lettered entries with `payload`, `error`,
//!   `deliveries` and `moved_at` fields
//!
//! Workers are members of one consumer group. An entry stays in the group's
//! pending list until acknowledged. Acknowledging also deletes the entry so
//! that `XLEN` counts exactly the unacknowledged work.
//!
//! Blocking reads run on a dedicated connection per consumer; the shared
//! [`ConnectionManager`] is multiplexed and must not be parked on `XREADGROUP`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{
    StreamClaimOptions, StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions,
    StreamReadReply,
};
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::backoff::{retry_with_backoff, RetryPolicy};
use super::{Delivery, QueueError, QueueSettings, QueueStats, WorkQueue};
use crate::metrics::MetricsCollector;
use crate::model::Execution;

const PAYLOAD_FIELD: &str = "payload";

/// Expired pending entries inspected per reclaim pass.
const RECLAIM_SCAN: usize = 16;

/// `XPENDING` restricted to entries idle for at least `ack_wait_ms`.
///
/// The `IDLE` filter (Redis 6.2+) runs on the server, so entries still in
/// flight never crowd expired or nak'd ones out of the scan window.
fn expired_pending_cmd(
    subject: &str,
    group: &str,
    ack_wait_ms: usize,
    count: usize,
) -> redis::Cmd {
    let mut cmd = redis::cmd("XPENDING");
    cmd.arg(subject)
        .arg(group)
        .arg("IDLE")
        .arg(ack_wait_ms)
        .arg("-")
        .arg("+")
        .arg(count);
    cmd
}

/// Work queue on a Redis stream with one consumer group.
pub struct RedisStreamQueue {
    client: redis::Client,
    redis: ConnectionManager,
    readers: Mutex<HashMap<String, MultiplexedConnection>>,
    settings: QueueSettings,
    dead_letter_subject: String,
    metrics: MetricsCollector,
}

impl RedisStreamQueue {
    /// Connects to the broker and makes sure the stream and group exist.
    ///
    /// Connection and group setup are retried per `policy`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` for an invalid URL and
    /// `QueueError::StreamUnavailable` once retries are exhausted.
    pub async fn connect(
        redis_url: &str,
        settings: QueueSettings,
        policy: &RetryPolicy,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = retry_with_backoff(policy, &settings.subject, || {
            let client = client.clone();
            let settings = &settings;
            async move {
                let mut conn = ConnectionManager::new(client).await?;
                ensure_group(&mut conn, settings).await?;
                Ok::<_, QueueError>(conn)
            }
        })
        .await
        .map_err(|(e, attempts)| QueueError::StreamUnavailable {
            subject: settings.subject.clone(),
            attempts,
            reason: e.to_string(),
        })?;

        info!(
            subject = %settings.subject,
            group = %settings.group,
            ack_wait_secs = settings.ack_wait.as_secs(),
            max_deliver = settings.max_deliver,
            "Connected to work queue"
        );

        Ok(Self::from_connection(client, redis, settings))
    }

    /// Builds a queue over an existing connection. The group must already exist.
    pub fn from_connection(
        client: redis::Client,
        redis: ConnectionManager,
        settings: QueueSettings,
    ) -> Self {
        Self {
            client,
            redis,
            readers: Mutex::new(HashMap::new()),
            dead_letter_subject: settings.dead_letter_subject(),
            settings,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Counts of pending and dead-lettered messages.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.redis.clone();
        let (pending, dead_lettered): (usize, usize) = redis::pipe()
            .xlen(&self.settings.subject)
            .xlen(&self.dead_letter_subject)
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            pending,
            dead_lettered,
        })
    }

    fn ack_wait_ms(&self) -> usize {
        self.settings.ack_wait.as_millis() as usize
    }

    async fn reader(&self, consumer: &str) -> Result<MultiplexedConnection, QueueError> {
        let mut readers = self.readers.lock().await;
        if let Some(conn) = readers.get(consumer) {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
        readers.insert(consumer.to_string(), conn.clone());
        Ok(conn)
    }

    async fn drop_reader(&self, consumer: &str) {
        self.readers.lock().await.remove(consumer);
    }

    /// Takes over the oldest pending entry whose ack window has expired.
    async fn reclaim_expired(&self, consumer: &str) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.redis.clone();
        let ack_wait_ms = self.ack_wait_ms();

        let pending: StreamPendingCountReply = expired_pending_cmd(
            &self.settings.subject,
            &self.settings.group,
            ack_wait_ms,
            RECLAIM_SCAN,
        )
        .query_async(&mut conn)
        .await?;

        for entry in pending.ids {
            let delivered = entry.times_delivered as u32;

            if self.settings.is_exhausted(delivered) {
                self.dead_letter(consumer, &entry.id, delivered).await?;
                continue;
            }

            let claimed: StreamClaimReply = conn
                .xclaim(
                    &self.settings.subject,
                    &self.settings.group,
                    consumer,
                    ack_wait_ms,
                    &[&entry.id],
                )
                .await?;

            // Another member claimed it first
            let Some(message) = claimed.ids.into_iter().next() else {
                continue;
            };

            match self.to_delivery(consumer, message, delivered + 1).await? {
                Some(delivery) => {
                    info!(
                        message_id = %delivery.message_id,
                        consumer = consumer,
                        previous_owner = %entry.consumer,
                        delivery_count = delivery.delivery_count,
                        "Redelivering expired message"
                    );
                    return Ok(Some(delivery));
                }
                None => continue,
            }
        }

        Ok(None)
    }

    async fn read_new(&self, consumer: &str, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut options = StreamReadOptions::default()
            .group(&self.settings.group, consumer)
            .count(1);
        // BLOCK 0 waits forever
        if !wait.is_zero() {
            options = options.block(wait.as_millis().max(1) as usize);
        }

        let mut reader = self.reader(consumer).await?;
        let reply: Option<StreamReadReply> = match reader
            .xread_options(&[&self.settings.subject], &[">"], &options)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                self.drop_reader(consumer).await;
                return Err(e.into());
            }
        };

        let Some(message) = reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .next()
        else {
            return Ok(None);
        };

        self.to_delivery(consumer, message, 1).await
    }

    /// Converts a stream entry into a delivery. Entries without a payload are
    /// acknowledged and dropped.
    async fn to_delivery(
        &self,
        consumer: &str,
        message: StreamId,
        delivery_count: u32,
    ) -> Result<Option<Delivery>, QueueError> {
        match message.get::<String>(PAYLOAD_FIELD) {
            Some(payload) => Ok(Some(Delivery {
                message_id: message.id,
                consumer: consumer.to_string(),
                payload,
                delivery_count,
            })),
            None => {
                warn!(message_id = %message.id, "Dropping stream entry without payload");
                self.remove(&message.id).await?;
                Ok(None)
            }
        }
    }

    async fn remove(&self, message_id: &str) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let (acked, _deleted): (usize, usize) = redis::pipe()
            .atomic()
            .xack(&self.settings.subject, &self.settings.group, &[message_id])
            .xdel(&self.settings.subject, &[message_id])
            .query_async(&mut conn)
            .await?;
        Ok(acked)
    }

    /// Moves an exhausted entry to the dead-letter stream.
    async fn dead_letter(
        &self,
        consumer: &str,
        message_id: &str,
        delivered: u32,
    ) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        // Take ownership first so only one member moves the entry
        let owned: Vec<String> = conn
            .xclaim_options(
                &self.settings.subject,
                &self.settings.group,
                consumer,
                self.ack_wait_ms(),
                &[message_id],
                StreamClaimOptions::default().with_justid(),
            )
            .await?;
        if owned.is_empty() {
            return Ok(());
        }

        let entries: redis::streams::StreamRangeReply = conn
            .xrange(&self.settings.subject, message_id, message_id)
            .await?;
        let payload = entries
            .ids
            .first()
            .and_then(|m| m.get::<String>(PAYLOAD_FIELD))
            .unwrap_or_default();

        let error = format!("exceeded {} deliveries", self.settings.max_deliver);
        let deliveries = delivered.to_string();
        let moved_at = chrono::Utc::now().to_rfc3339();
        let _: String = conn
            .xadd(
                &self.dead_letter_subject,
                "*",
                &[
                    (PAYLOAD_FIELD, payload.as_str()),
                    ("error", error.as_str()),
                    ("deliveries", deliveries.as_str()),
                    ("moved_at", moved_at.as_str()),
                ],
            )
            .await?;

        self.remove(message_id).await?;
        self.metrics.record_dead_letter();

        warn!(
            message_id = message_id,
            deliveries = delivered,
            dead_letter = %self.dead_letter_subject,
            "Message dead-lettered"
        );

        Ok(())
    }
}

async fn ensure_group(
    conn: &mut ConnectionManager,
    settings: &QueueSettings,
) -> Result<(), QueueError> {
    // Start from the beginning so entries written before the group existed are delivered
    let created: Result<(), redis::RedisError> = conn
        .xgroup_create_mkstream(&settings.subject, &settings.group, "0")
        .await;

    match created {
        Ok(()) => {
            info!(subject = %settings.subject, group = %settings.group, "Created consumer group");
            Ok(())
        }
        Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl WorkQueue for RedisStreamQueue {
    async fn enqueue(&self, execution: &Execution) -> Result<String, QueueError> {
        let payload = serde_json::to_string(execution)?;
        let mut conn = self.redis.clone();
        let id: String = conn
            .xadd(&self.settings.subject, "*", &[(PAYLOAD_FIELD, payload)])
            .await?;

        debug!(execution_id = %execution.id, message_id = %id, "Enqueued execution");
        Ok(id)
    }

    async fn fetch(&self, consumer: &str, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        if let Some(delivery) = self.reclaim_expired(consumer).await? {
            return Ok(Some(delivery));
        }
        self.read_new(consumer, wait).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        if self.remove(&delivery.message_id).await? == 0 {
            return Err(QueueError::NotPending(delivery.message_id.clone()));
        }
        Ok(())
    }

    async fn nak(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        // Back-date the idle time so the next reclaim pass picks it up
        let options = StreamClaimOptions::default()
            .idle(self.ack_wait_ms())
            .with_justid();
        let claimed: Vec<String> = conn
            .xclaim_options(
                &self.settings.subject,
                &self.settings.group,
                &delivery.consumer,
                0,
                &[&delivery.message_id],
                options,
            )
            .await?;

        if claimed.is_empty() {
            return Err(QueueError::NotPending(delivery.message_id.clone()));
        }
        Ok(())
    }

    async fn pending_count(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.xlen(&self.settings.subject).await?;
        Ok(len)
    }
}
