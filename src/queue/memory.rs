//! In-process [`WorkQueue`] with the same delivery semantics as the Redis
//! stream queue. Used by tests and single-process deployments.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::warn;

use super::{Delivery, QueueError, QueueSettings, QueueStats, WorkQueue};
use crate::metrics::MetricsCollector;
use crate::model::Execution;

/// A message that exhausted its deliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub message_id: String,
    pub payload: String,
    pub deliveries: u32,
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    eligible_at: Instant,
    delivered: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    next_seq: u64,
    payloads: BTreeMap<u64, String>,
    unread: VecDeque<u64>,
    pending: BTreeMap<u64, PendingEntry>,
    dead: Vec<DeadLetter>,
}

/// Memory-backed competing-consumer queue.
pub struct MemoryQueue {
    settings: QueueSettings,
    state: Mutex<QueueState>,
    wakeup: Notify,
    metrics: MetricsCollector,
}

fn message_id(seq: u64) -> String {
    format!("{}-0", seq)
}

fn parse_seq(message_id: &str) -> Option<u64> {
    message_id.split('-').next()?.parse().ok()
}

enum Poll {
    Ready(Delivery),
    Wait(Option<Instant>),
}

impl MemoryQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(QueueState::default()),
            wakeup: Notify::new(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            pending: state.payloads.len(),
            dead_lettered: state.dead.len(),
        }
    }

    /// Messages moved out of the queue after exhausting their deliveries.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead.clone()
    }

    fn poll(&self, state: &mut QueueState, consumer: &str) -> Poll {
        let now = Instant::now();

        let expired: Vec<u64> = state
            .pending
            .iter()
            .filter(|(_, p)| p.eligible_at <= now)
            .map(|(seq, _)| *seq)
            .collect();

        for seq in expired {
            let delivered = state.pending.get(&seq).map(|p| p.delivered).unwrap_or(0);

            if self.settings.is_exhausted(delivered) {
                state.pending.remove(&seq);
                let payload = state.payloads.remove(&seq).unwrap_or_default();
                state.dead.push(DeadLetter {
                    message_id: message_id(seq),
                    payload,
                    deliveries: delivered,
                });
                self.metrics.record_dead_letter();
                warn!(
                    message_id = %message_id(seq),
                    deliveries = delivered,
                    "Message dead-lettered"
                );
                continue;
            }

            if let Some(delivery) = self.deliver(state, seq, consumer, now, delivered + 1) {
                return Poll::Ready(delivery);
            }
        }

        while let Some(seq) = state.unread.pop_front() {
            if let Some(delivery) = self.deliver(state, seq, consumer, now, 1) {
                return Poll::Ready(delivery);
            }
        }

        Poll::Wait(state.pending.values().map(|p| p.eligible_at).min())
    }

    fn deliver(
        &self,
        state: &mut QueueState,
        seq: u64,
        consumer: &str,
        now: Instant,
        delivered: u32,
    ) -> Option<Delivery> {
        let payload = state.payloads.get(&seq)?.clone();
        state.pending.insert(
            seq,
            PendingEntry {
                consumer: consumer.to_string(),
                eligible_at: now + self.settings.ack_wait,
                delivered,
            },
        );

        Some(Delivery {
            message_id: message_id(seq),
            consumer: consumer.to_string(),
            payload,
            delivery_count: delivered,
        })
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, execution: &Execution) -> Result<String, QueueError> {
        let payload = serde_json::to_string(execution)?;

        let mut state = self.state.lock().await;
        state.next_seq += 1;
        let seq = state.next_seq;
        state.payloads.insert(seq, payload);
        state.unread.push_back(seq);
        drop(state);

        self.wakeup.notify_one();
        Ok(message_id(seq))
    }

    async fn fetch(&self, consumer: &str, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;

        loop {
            let next_eligible = {
                let mut state = self.state.lock().await;
                match self.poll(&mut state, consumer) {
                    Poll::Ready(delivery) => return Ok(Some(delivery)),
                    Poll::Wait(next) => next,
                }
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            let wake_at = next_eligible.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let seq = parse_seq(&delivery.message_id)
            .ok_or_else(|| QueueError::NotPending(delivery.message_id.clone()))?;

        let mut state = self.state.lock().await;
        if state.pending.remove(&seq).is_none() {
            return Err(QueueError::NotPending(delivery.message_id.clone()));
        }
        state.payloads.remove(&seq);
        Ok(())
    }

    async fn nak(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let seq = parse_seq(&delivery.message_id)
            .ok_or_else(|| QueueError::NotPending(delivery.message_id.clone()))?;

        let mut state = self.state.lock().await;
        let entry = state
            .pending
            .get_mut(&seq)
            .ok_or_else(|| QueueError::NotPending(delivery.message_id.clone()))?;
        entry.consumer = delivery.consumer.clone();
        entry.eligible_at = Instant::now();
        drop(state);

        self.wakeup.notify_one();
        Ok(())
    }

    async fn pending_count(&self) -> Result<usize, QueueError> {
        Ok(self.state.lock().await.payloads.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn queue() -> MemoryQueue {
        MemoryQueue::new(
            QueueSettings::default()
                .with_ack_wait(Duration::from_secs(60))
                .with_max_deliver(3),
        )
    }

    fn execution(n: usize) -> Execution {
        Execution::new(format!("fn-{}", n), "user-1", "")
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_in_order_to_competing_consumers() {
        let q = queue();
        let first = execution(1);
        let second = execution(2);
        q.enqueue(&first).await.expect("enqueue");
        q.enqueue(&second).await.expect("enqueue");

        let a = q.fetch("worker-a", Duration::ZERO).await.expect("fetch").expect("message");
        let b = q.fetch("worker-b", Duration::ZERO).await.expect("fetch").expect("message");

        assert_eq!(a.execution().expect("decode").id, first.id);
        assert_eq!(b.execution().expect("decode").id, second.id);
        assert_eq!(a.consumer, "worker-a");
        assert!(q.fetch("worker-c", Duration::ZERO).await.expect("fetch").is_none());
        assert_eq!(q.pending_count().await.expect("count"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_removes_message() {
        let q = queue();
        q.enqueue(&execution(1)).await.expect("enqueue");

        let delivery = q.fetch("w", Duration::ZERO).await.expect("fetch").expect("message");
        q.ack(&delivery).await.expect("ack");

        assert_eq!(q.pending_count().await.expect("count"), 0);
        assert!(matches!(q.ack(&delivery).await, Err(QueueError::NotPending(_))));

        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(q.fetch("w", Duration::ZERO).await.expect("fetch").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_message_redelivered_after_ack_wait() {
        let q = queue();
        q.enqueue(&execution(1)).await.expect("enqueue");

        let first = q.fetch("crashed", Duration::ZERO).await.expect("fetch").expect("message");
        assert_eq!(first.delivery_count, 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(q.fetch("other", Duration::ZERO).await.expect("fetch").is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        let second = q.fetch("other", Duration::ZERO).await.expect("fetch").expect("redelivery");
        assert_eq!(second.message_id, first.message_id);
        assert_eq!(second.consumer, "other");
        assert_eq!(second.delivery_count, 2);
        assert!(second.is_redelivery());
    }

    #[tokio::test(start_paused = true)]
    async fn test_nak_redelivers_immediately() {
        let q = queue();
        q.enqueue(&execution(1)).await.expect("enqueue");

        let delivery = q.fetch("w", Duration::ZERO).await.expect("fetch").expect("message");
        q.nak(&delivery).await.expect("nak");

        let again = q.fetch("w", Duration::ZERO).await.expect("fetch").expect("redelivery");
        assert_eq!(again.message_id, delivery.message_id);
        assert_eq!(again.delivery_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letters_after_max_deliver() {
        let q = queue();
        q.enqueue(&execution(1)).await.expect("enqueue");

        for expected in 1..=3 {
            let delivery = q.fetch("w", Duration::ZERO).await.expect("fetch").expect("message");
            assert_eq!(delivery.delivery_count, expected);
            q.nak(&delivery).await.expect("nak");
        }

        assert!(q.fetch("w", Duration::ZERO).await.expect("fetch").is_none());
        assert_eq!(q.pending_count().await.expect("count"), 0);

        let dead = q.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].deliveries, 3);
        assert_eq!(q.stats().await.dead_lettered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_waits_for_enqueue() {
        let q = Arc::new(queue());

        let producer = Arc::clone(&q);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            producer.enqueue(&execution(1)).await.expect("enqueue");
        });

        let delivery = q.fetch("w", Duration::from_secs(1)).await.expect("fetch");
        assert!(delivery.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_times_out_on_empty_queue() {
        let q = queue();
        let started = Instant::now();

        let delivery = q.fetch("w", Duration::from_millis(500)).await.expect("fetch");

        assert!(delivery.is_none());
        assert!(started.elapsed() >= Duration::from_millis(500));
    }
}
