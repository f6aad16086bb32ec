//! Consumer and retry engine
//!
//! Pulls deliveries from the work queue, indexes each record, and settles
//! the delivery: ack on success, requeue with the next attempt count while
//! the retry budget lasts, otherwise reject so the broker dead-letters it.

use crate::error::{AuditError, Result};
use crate::indexer::Indexer;
use crate::provider::{BrokerProvider, Delivery, DeliveryStream};
use crate::topology::Topology;
use crate::types::RetryEnvelope;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Default retry budget before a record is dead-lettered
pub const DEFAULT_MAX_RETRY: u32 = 3;

/// Dead-letter reason for deliveries whose body cannot be decoded
pub const MALFORMED_REASON: &str = "malformed message";

/// Pause after a broken delivery stream before pulling again
const STREAM_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// What to do with a delivery after processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Indexed; remove from the queue
    Ack,

    /// Failed within budget; redeliver with `next_attempt`
    Requeue { next_attempt: u32 },

    /// Failed with the budget spent (or undecodable); route to the DLQ
    DeadLetter { reason: String },
}

/// Retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retry: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry: DEFAULT_MAX_RETRY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retry: u32) -> Self {
        Self { max_retry }
    }

    /// Disposition for a failed attempt
    pub fn on_failure(&self, attempt_count: u32, reason: impl Into<String>) -> Disposition {
        if attempt_count < self.max_retry {
            Disposition::Requeue {
                next_attempt: attempt_count + 1,
            }
        } else {
            Disposition::DeadLetter {
                reason: reason.into(),
            }
        }
    }
}

/// Tally of settled deliveries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeReport {
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,

    /// Deliveries whose settlement itself failed
    pub failed: u64,
}

impl ConsumeReport {
    pub fn total(&self) -> u64 {
        self.acked + self.requeued + self.dead_lettered + self.failed
    }

    pub fn merge(&mut self, other: &ConsumeReport) {
        self.acked += other.acked;
        self.requeued += other.requeued;
        self.dead_lettered += other.dead_lettered;
        self.failed += other.failed;
    }

    fn tally(&mut self, outcome: &Result<Disposition>) {
        match outcome {
            Ok(Disposition::Ack) => self.acked += 1,
            Ok(Disposition::Requeue { .. }) => self.requeued += 1,
            Ok(Disposition::DeadLetter { .. }) => self.dead_lettered += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// Work-queue consumer
///
/// Cheap to clone; every worker gets its own clone and delivery stream.
#[derive(Clone)]
pub struct AuditConsumer {
    broker: Arc<dyn BrokerProvider>,
    indexer: Indexer,
    policy: RetryPolicy,
    queue: String,
    dlq: String,
}

impl AuditConsumer {
    pub fn new(broker: Arc<dyn BrokerProvider>, indexer: Indexer, topology: &Topology) -> Self {
        Self {
            broker,
            indexer,
            policy: RetryPolicy::default(),
            queue: topology.work_queue.clone(),
            dlq: topology.dlq_queue.clone(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Index one envelope and decide its disposition
    pub async fn handle(&self, envelope: &RetryEnvelope) -> Disposition {
        let record = &envelope.record;
        let error = match self.indexer.index(record).await {
            Ok(()) => {
                tracing::debug!(
                    trace_id = %record.trace_id,
                    attempt_count = envelope.attempt_count,
                    "Audit record indexed"
                );
                return Disposition::Ack;
            }
            Err(e) => e,
        };

        let disposition = self.policy.on_failure(envelope.attempt_count, error.to_string());
        match disposition {
            Disposition::Requeue { next_attempt } => {
                tracing::warn!(
                    trace_id = %record.trace_id,
                    attempt_count = next_attempt,
                    dlq = false,
                    error = %error,
                    "Indexing failed, requeueing"
                );
            }
            Disposition::DeadLetter { ref reason } => {
                tracing::error!(
                    trace_id = %record.trace_id,
                    attempt_count = envelope.attempt_count,
                    dlq = true,
                    queue = %self.dlq,
                    reason = %reason,
                    "Retries exhausted, dead-lettering"
                );
            }
            Disposition::Ack => {}
        }
        disposition
    }

    /// Decode, handle, and settle one delivery
    pub async fn process(&self, delivery: Delivery) -> Result<Disposition> {
        let envelope = match delivery.message.envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(
                    queue = %delivery.message.queue,
                    correlation_id = ?delivery.message.correlation_id,
                    attempt_count = delivery.message.attempt_count,
                    dlq = true,
                    error = %e,
                    "Undecodable audit message, dead-lettering"
                );
                delivery.dead_letter(MALFORMED_REASON).await?;
                return Ok(Disposition::DeadLetter {
                    reason: MALFORMED_REASON.to_string(),
                });
            }
        };

        let disposition = self.handle(&envelope).await;
        match disposition {
            Disposition::Ack => delivery.ack().await?,
            Disposition::Requeue { next_attempt } => delivery.requeue(next_attempt).await?,
            Disposition::DeadLetter { ref reason } => delivery.dead_letter(reason.clone()).await?,
        }
        Ok(disposition)
    }

    /// Process deliveries until none arrives for `idle`, or the stream ends
    pub async fn drain(
        &self,
        stream: &mut dyn DeliveryStream,
        idle: Duration,
    ) -> Result<ConsumeReport> {
        let mut report = ConsumeReport::default();
        loop {
            let delivery = match tokio::time::timeout(idle, stream.next()).await {
                Err(_) => break,
                Ok(next) => match next? {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let outcome = self.process(delivery).await;
            if let Err(ref e) = outcome {
                tracing::warn!(queue = %self.queue, error = %e, "Failed to settle delivery");
            }
            report.tally(&outcome);
        }
        Ok(report)
    }

    /// Process deliveries until `shutdown` flips to true or its sender drops
    pub async fn run(
        &self,
        mut stream: Box<dyn DeliveryStream>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ConsumeReport {
        let mut report = ConsumeReport::default();
        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                next = stream.next() => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    let outcome = self.process(delivery).await;
                    if let Err(ref e) = outcome {
                        tracing::warn!(queue = %self.queue, error = %e, "Failed to settle delivery");
                    }
                    report.tally(&outcome);
                }
                Ok(None) => {
                    tracing::info!(queue = %self.queue, "Delivery stream closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(queue = %self.queue, error = %e, "Delivery stream error");
                    tokio::time::sleep(STREAM_ERROR_BACKOFF).await;
                }
            }
        }
        report
    }

    /// Start `workers` tasks, each with its own stream on the work queue
    pub async fn spawn_workers(
        &self,
        workers: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<ConsumeReport>>> {
        if workers == 0 {
            return Err(AuditError::Config("consumer workers must be at least 1".to_string()));
        }

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let stream = self.broker.consume(&self.queue).await?;
            let consumer = self.clone();
            let shutdown = shutdown.clone();
            let span = tracing::info_span!("audit_worker", worker, queue = %self.queue);
            handles.push(tokio::spawn(
                async move { consumer.run(stream, shutdown).await }.instrument(span),
            ));
        }

        tracing::info!(
            queue = %self.queue,
            workers,
            max_retry = self.policy.max_retry,
            "Consumer workers started"
        );
        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::MemoryBroker;
    use crate::provider::OutboundMessage;
    use crate::sink::MemorySearchSink;
    use crate::types::AuditRecord;
    use bytes::Bytes;

    const IDLE: Duration = Duration::from_millis(50);

    struct Harness {
        broker: MemoryBroker,
        sink: MemorySearchSink,
        topology: Topology,
        consumer: AuditConsumer,
    }

    async fn harness() -> Harness {
        let broker = MemoryBroker::new();
        let sink = MemorySearchSink::new();
        let topology = Topology::default();
        broker.declare(&topology).await.unwrap();
        let consumer = AuditConsumer::new(
            Arc::new(broker.clone()),
            Indexer::new(Arc::new(sink.clone())),
            &topology,
        );
        Harness {
            broker,
            sink,
            topology,
            consumer,
        }
    }

    async fn publish(h: &Harness, trace_id: &str) {
        let record = AuditRecord::new("alice", "login", "Auth", "login").with_trace_id(trace_id);
        let message =
            OutboundMessage::for_envelope(&h.topology, &RetryEnvelope::new(record)).unwrap();
        h.broker.publish(message).await.unwrap().await;
    }

    #[test]
    fn test_retry_policy_boundaries() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.on_failure(0, "x"), Disposition::Requeue { next_attempt: 1 });
        assert_eq!(policy.on_failure(2, "x"), Disposition::Requeue { next_attempt: 3 });
        assert_eq!(
            policy.on_failure(3, "x"),
            Disposition::DeadLetter {
                reason: "x".to_string()
            }
        );
        assert!(matches!(
            RetryPolicy::new(0).on_failure(0, "x"),
            Disposition::DeadLetter { .. }
        ));
    }

    #[tokio::test]
    async fn test_handle_success_acks() {
        let h = harness().await;
        let record = AuditRecord::new("alice", "login", "Auth", "login").with_trace_id("t1");
        let disposition = h.consumer.handle(&RetryEnvelope::new(record)).await;
        assert_eq!(disposition, Disposition::Ack);
        assert!(h.sink.get("t1").is_some());
    }

    #[tokio::test]
    async fn test_handle_failure_requeues_then_dead_letters() {
        let h = harness().await;
        h.sink.set_available(false);
        let record = AuditRecord::new("alice", "login", "Auth", "login").with_trace_id("t1");

        let mut envelope = RetryEnvelope::new(record);
        for expected in 1..=3 {
            let disposition = h.consumer.handle(&envelope).await;
            assert_eq!(disposition, Disposition::Requeue { next_attempt: expected });
            envelope = envelope.retried();
        }
        assert!(matches!(
            h.consumer.handle(&envelope).await,
            Disposition::DeadLetter { .. }
        ));
    }

    #[tokio::test]
    async fn test_drain_recovers_after_transient_failures() {
        let h = harness().await;
        h.sink.fail_next_writes(2);
        publish(&h, "t1").await;

        let mut stream = h.broker.consume(&h.topology.work_queue).await.unwrap();
        let report = h.consumer.drain(stream.as_mut(), IDLE).await.unwrap();

        assert_eq!(report.requeued, 2);
        assert_eq!(report.acked, 1);
        assert_eq!(report.dead_lettered, 0);
        assert!(h.sink.get("t1").is_some());
        assert_eq!(h.broker.queue_depth(&h.topology.dlq_queue).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_message_is_dead_lettered() {
        let h = harness().await;
        let message = OutboundMessage {
            exchange: h.topology.exchange.clone(),
            routing_key: h.topology.routing_key.clone(),
            correlation_id: "bad".to_string(),
            attempt_count: 0,
            body: Bytes::from_static(b"{not json"),
        };
        h.broker.publish(message).await.unwrap().await;

        let mut stream = h.broker.consume(&h.topology.work_queue).await.unwrap();
        let report = h.consumer.drain(stream.as_mut(), IDLE).await.unwrap();

        assert_eq!(report.dead_lettered, 1);
        assert_eq!(h.sink.write_attempts(), 0);
        let dead = h.broker.peek(&h.topology.dlq_queue);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].death_reason.as_deref(), Some(MALFORMED_REASON));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness().await;
        publish(&h, "t1").await;

        let (tx, rx) = watch::channel(false);
        let handles = h.consumer.spawn_workers(2, rx).await.unwrap();

        for _ in 0..50 {
            if h.sink.get("t1").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();

        let mut total = ConsumeReport::default();
        for handle in handles {
            total.merge(&handle.await.unwrap());
        }
        assert_eq!(total.acked, 1);
        assert_eq!(h.broker.queue_depth(&h.topology.work_queue).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_spawn_zero_workers_is_an_error() {
        let h = harness().await;
        let (_tx, rx) = watch::channel(false);
        assert!(matches!(
            h.consumer.spawn_workers(0, rx).await,
            Err(AuditError::Config(_))
        ));
    }
}
