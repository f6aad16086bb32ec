//! Dead-letter queue replay
//!
//! Dead-lettered records stay in the DLQ until an operator replays them.
//! Replay moves each record back to the work exchange with a fresh retry
//! budget; the DLQ copy is only acknowledged once the broker confirms the
//! republish.

use crate::error::Result;
use crate::provider::{BrokerProvider, Confirmation, Delivery, OutboundMessage};
use crate::topology::Topology;
use crate::types::RetryEnvelope;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Default bound on waiting for a republish confirm
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one replay run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Moved back to the work queue
    pub replayed: u64,

    /// Republish not confirmed; left in the DLQ
    pub failed: u64,

    /// Undecodable; left in the DLQ
    pub malformed: u64,
}

/// Moves dead-lettered records back onto the work path
#[derive(Clone)]
pub struct DeadLetterReplayer {
    broker: Arc<dyn BrokerProvider>,
    topology: Topology,
    confirm_timeout: Duration,
}

impl DeadLetterReplayer {
    pub fn new(broker: Arc<dyn BrokerProvider>, topology: Topology) -> Self {
        Self {
            broker,
            topology,
            confirm_timeout: CONFIRM_TIMEOUT,
        }
    }

    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    /// Messages waiting in the DLQ
    pub async fn depth(&self) -> Result<u64> {
        self.broker.queue_depth(&self.topology.dlq_queue).await
    }

    /// Replay up to `limit` messages, stopping early once the DLQ stays
    /// quiet for `idle`
    ///
    /// Each message present when the run starts is visited at most once,
    /// so messages that go back to the DLQ are not retried in a loop.
    pub async fn replay(&self, limit: usize, idle: Duration) -> Result<ReplayReport> {
        let mut report = ReplayReport::default();
        let depth = usize::try_from(self.depth().await?).unwrap_or(usize::MAX);
        let budget = limit.min(depth);
        if budget == 0 {
            return Ok(report);
        }

        let mut stream = self.broker.consume(&self.topology.dlq_queue).await?;
        for _ in 0..budget {
            let delivery = match tokio::time::timeout(idle, stream.next()).await {
                Err(_) => break,
                Ok(next) => match next? {
                    Some(delivery) => delivery,
                    None => break,
                },
            };
            self.replay_one(delivery, &mut report).await?;
        }

        tracing::info!(
            dlq = %self.topology.dlq_queue,
            replayed = report.replayed,
            failed = report.failed,
            malformed = report.malformed,
            "Dead-letter replay finished"
        );
        Ok(report)
    }

    async fn replay_one(&self, delivery: Delivery, report: &mut ReplayReport) -> Result<()> {
        let attempt_count = delivery.message.attempt_count;
        let death_reason = delivery.message.death_reason.clone();
        let envelope = match delivery.message.envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(
                    correlation_id = ?delivery.message.correlation_id,
                    error = %e,
                    "Undecodable dead letter left in place"
                );
                report.malformed += 1;
                return delivery.requeue(attempt_count).await;
            }
        };

        let trace_id = envelope.record.trace_id.clone();
        let message =
            OutboundMessage::for_envelope(&self.topology, &RetryEnvelope::new(envelope.record))?;

        let confirmation = match self.broker.publish(message).await {
            Ok(pending) => tokio::time::timeout(self.confirm_timeout, pending)
                .await
                .unwrap_or(Confirmation::Nack {
                    reason: "confirm timed out".to_string(),
                }),
            Err(e) => Confirmation::Nack {
                reason: e.to_string(),
            },
        };

        match confirmation {
            Confirmation::Ack => {
                delivery.ack().await?;
                report.replayed += 1;
                tracing::info!(
                    trace_id = %trace_id,
                    previous_attempts = attempt_count,
                    death_reason = ?death_reason,
                    "Dead letter replayed"
                );
            }
            other => {
                tracing::warn!(
                    trace_id = %trace_id,
                    outcome = ?other,
                    "Replay not confirmed, dead letter left in place"
                );
                report.failed += 1;
                delivery.requeue(attempt_count).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::MemoryBroker;
    use crate::types::AuditRecord;
    use bytes::Bytes;

    const IDLE: Duration = Duration::from_millis(50);

    async fn broker_with_dead_letters(trace_ids: &[&str]) -> (MemoryBroker, Topology) {
        let broker = MemoryBroker::new();
        let topology = Topology::default();
        broker.declare(&topology).await.unwrap();

        for trace_id in trace_ids {
            let record = AuditRecord::new("alice", "login", "Auth", "login").with_trace_id(*trace_id);
            let mut message =
                OutboundMessage::for_envelope(&topology, &RetryEnvelope::new(record)).unwrap();
            message.exchange = topology.dlx_exchange.clone();
            message.routing_key = topology.dlq_routing_key.clone();
            message.attempt_count = 3;
            broker.publish(message).await.unwrap().await;
        }
        (broker, topology)
    }

    #[tokio::test]
    async fn test_replay_moves_to_work_queue_with_fresh_budget() {
        let (broker, topology) = broker_with_dead_letters(&["t1", "t2"]).await;
        let replayer = DeadLetterReplayer::new(Arc::new(broker.clone()), topology.clone());

        let report = replayer.replay(10, IDLE).await.unwrap();
        assert_eq!(report.replayed, 2);
        assert_eq!(replayer.depth().await.unwrap(), 0);

        let work = broker.peek(&topology.work_queue);
        assert_eq!(work.len(), 2);
        assert!(work.iter().all(|m| m.attempt_count == 0));
    }

    #[tokio::test]
    async fn test_replay_respects_limit() {
        let (broker, topology) = broker_with_dead_letters(&["t1", "t2", "t3"]).await;
        let replayer = DeadLetterReplayer::new(Arc::new(broker.clone()), topology.clone());

        let report = replayer.replay(1, IDLE).await.unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(replayer.depth().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unroutable_replay_stays_in_dlq() {
        let (broker, topology) = broker_with_dead_letters(&["t1"]).await;
        let misrouted = Topology {
            routing_key: "audit.event.nowhere".to_string(),
            ..topology.clone()
        };
        let replayer = DeadLetterReplayer::new(Arc::new(broker.clone()), misrouted);

        let report = replayer.replay(10, IDLE).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.replayed, 0);
        assert_eq!(broker.queue_depth(&topology.dlq_queue).await.unwrap(), 1);
        assert_eq!(broker.peek(&topology.dlq_queue)[0].attempt_count, 3);
    }

    #[tokio::test]
    async fn test_malformed_dead_letter_is_visited_once() {
        let (broker, topology) = broker_with_dead_letters(&[]).await;
        let garbage = OutboundMessage {
            exchange: topology.dlx_exchange.clone(),
            routing_key: topology.dlq_routing_key.clone(),
            correlation_id: "bad".to_string(),
            attempt_count: 0,
            body: Bytes::from_static(b"garbage"),
        };
        broker.publish(garbage).await.unwrap().await;

        let replayer = DeadLetterReplayer::new(Arc::new(broker.clone()), topology.clone());
        let report = replayer.replay(100, IDLE).await.unwrap();
        assert_eq!(report.malformed, 1);
        assert_eq!(replayer.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_dlq() {
        let (broker, topology) = broker_with_dead_letters(&[]).await;
        let replayer = DeadLetterReplayer::new(Arc::new(broker), topology);
        assert_eq!(replayer.replay(10, IDLE).await.unwrap(), ReplayReport::default());
    }
}
