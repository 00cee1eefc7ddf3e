//! Durable work queue for pending executions.
//!
//! The queue is a persistent stream on a fixed subject consumed by one named
//! delivery group. Every worker is a competing member of that group:
//!
//! ```text
//!      submit ──► [ executions.pending ] ──► group "execution-workers"
//!                                              ├─► worker-a
//!                                              ├─► worker-b
//!                                              └─► worker-n
//! ```
//!
//! Delivery is at-least-once. A message handed to a member stays pending
//! until acknowledged; if it is not acknowledged within `ack_wait` (or is
//! negatively acknowledged) it is redelivered, possibly to another member.
//! A message that has already been delivered `max_deliver` times is moved to
//! the dead-letter stream instead of being delivered again.
//!
//! Two implementations exist: [`RedisStreamQueue`] (Redis Streams consumer
//! groups) and [`MemoryQueue`] (same semantics in-process).

pub mod backoff;
pub mod memory;
pub mod redis_stream;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::Execution;

pub use backoff::{retry_with_backoff, RetryPolicy};
pub use memory::MemoryQueue;
pub use redis_stream::RedisStreamQueue;

/// Subject carrying pending executions.
pub const EXECUTIONS_SUBJECT: &str = "executions.pending";

/// Delivery group shared by all workers.
pub const WORKERS_GROUP: &str = "execution-workers";

/// Default number of deliveries before a message is dead-lettered.
pub const DEFAULT_MAX_DELIVER: u32 = 3;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to the broker.
    #[error("Broker connection failed: {0}")]
    ConnectionFailed(String),

    /// The stream or group could not be reached after all retries.
    #[error("Stream '{subject}' unavailable after {attempts} attempts: {reason}")]
    StreamUnavailable {
        subject: String,
        attempts: u32,
        reason: String,
    },

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize message data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// The message is no longer pending for this group.
    #[error("Message {0} not pending")]
    NotPending(String),
}

/// Queue wiring shared by producers and consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    /// Stream subject.
    pub subject: String,
    /// Delivery group name.
    pub group: String,
    /// How long a delivered message may stay unacknowledged.
    pub ack_wait: Duration,
    /// Deliveries allowed before dead-lettering.
    pub max_deliver: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            subject: EXECUTIONS_SUBJECT.to_string(),
            group: WORKERS_GROUP.to_string(),
            ack_wait: Duration::from_secs(360),
            max_deliver: DEFAULT_MAX_DELIVER,
        }
    }
}

impl QueueSettings {
    /// Name of the stream receiving dead-lettered messages.
    pub fn dead_letter_subject(&self) -> String {
        format!("{}.dead", self.subject)
    }

    /// Whether a message already delivered `times_delivered` times must be
    /// dead-lettered instead of delivered again.
    pub fn is_exhausted(&self, times_delivered: u32) -> bool {
        times_delivered >= self.max_deliver
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    pub fn with_max_deliver(mut self, max_deliver: u32) -> Self {
        self.max_deliver = max_deliver;
        self
    }
}

/// One delivery of a queue message to a group member.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Broker-assigned message id.
    pub message_id: String,
    /// Group member the message was delivered to.
    pub consumer: String,
    /// Serialized execution snapshot.
    pub payload: String,
    /// How many times this message has been delivered, this one included.
    pub delivery_count: u32,
}

impl Delivery {
    /// Decodes the execution snapshot carried by the message.
    pub fn execution(&self) -> Result<Execution, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }

    /// Returns whether this is a redelivery.
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

/// What the consumer wants done with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processing finished; remove the message.
    Ack,
    /// Processing did not finish; redeliver.
    Nak,
}

/// Snapshot of queue state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Unacknowledged messages, in-flight ones included.
    pub pending: usize,
    /// Messages moved to the dead-letter stream.
    pub dead_lettered: usize,
}

/// Competing-consumer work queue.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Appends an execution snapshot. Returns the message id.
    async fn enqueue(&self, execution: &Execution) -> Result<String, QueueError>;

    /// Waits up to `wait` for the next message for `consumer`.
    ///
    /// Messages whose ack window expired are redelivered before new ones.
    async fn fetch(&self, consumer: &str, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Acknowledges a delivery; the message leaves the queue.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Negatively acknowledges a delivery so it is redelivered immediately.
    async fn nak(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Number of messages not yet acknowledged.
    async fn pending_count(&self) -> Result<usize, QueueError>;
}
