//! Broker provider trait: the core abstraction for message brokers
//!
//! All brokers (NATS JetStream, in-memory) implement `BrokerProvider` to
//! provide a uniform API for topology declaration, publishing with
//! confirm/return outcomes, and manual-ack consumption.

use crate::error::{AuditError, Result};
use crate::topology::Topology;
use crate::types::{AuditRecord, RetryEnvelope};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;

pub mod memory;
pub mod nats;

/// Header carrying the retry attempt counter
pub const ATTEMPT_COUNT_HEADER: &str = "attemptCount";

/// Header carrying the correlation id (the record's trace id)
pub const CORRELATION_ID_HEADER: &str = "correlationId";

/// Header carrying why a message was dead-lettered
pub const DEATH_REASON_HEADER: &str = "x-death-reason";

/// A message about to be published
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub correlation_id: String,
    pub attempt_count: u32,
    pub body: Bytes,
}

impl OutboundMessage {
    /// Encode an envelope for the work exchange of `topology`
    pub fn for_envelope(topology: &Topology, envelope: &RetryEnvelope) -> Result<Self> {
        let body = serde_json::to_vec(&envelope.record)?;
        Ok(Self {
            exchange: topology.exchange.clone(),
            routing_key: topology.routing_key.clone(),
            correlation_id: envelope.record.trace_id.clone(),
            attempt_count: envelope.attempt_count,
            body: body.into(),
        })
    }
}

/// A message received from a queue
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Queue the message was consumed from
    pub queue: String,
    pub correlation_id: Option<String>,
    pub attempt_count: u32,
    pub death_reason: Option<String>,
    pub body: Bytes,
}

impl InboundMessage {
    /// Decode the body and attempt counter into a retry envelope
    pub fn envelope(&self) -> Result<RetryEnvelope> {
        let record: AuditRecord = serde_json::from_slice(&self.body)?;
        Ok(RetryEnvelope {
            record,
            attempt_count: self.attempt_count,
        })
    }
}

/// Parse an `attemptCount` header value; absent or garbage means 0
pub fn parse_attempt_count(value: Option<&str>) -> u32 {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(0)
}

/// Outcome of a publish once the broker has answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    /// The message reached the exchange and was routed
    Ack,

    /// The broker refused the message
    Nack { reason: String },

    /// The message reached the exchange but no queue is bound for its key
    Returned {
        exchange: String,
        routing_key: String,
        reply_text: String,
    },
}

/// Broker answer for a published message, resolved asynchronously
pub type PendingConfirm = BoxFuture<'static, Confirmation>;

/// Core trait for message brokers
///
/// `publish` returns as soon as the broker client has taken the message;
/// the returned future resolves with the confirm or return outcome.
#[async_trait]
pub trait BrokerProvider: Send + Sync {
    /// Declare exchanges, queues, and bindings
    ///
    /// Idempotent for identical declarations; incompatible redeclaration
    /// fails with `AuditError::Topology`.
    async fn declare(&self, topology: &Topology) -> Result<()>;

    /// Hand a message to the broker
    async fn publish(&self, message: OutboundMessage) -> Result<PendingConfirm>;

    /// Open a manual-ack delivery stream on a declared queue
    async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryStream>>;

    /// Number of messages ready in a queue
    async fn queue_depth(&self, queue: &str) -> Result<u64>;

    /// Provider name (e.g., "nats", "memory")
    fn name(&self) -> &str;
}

/// Async stream of deliveries from one queue
#[async_trait]
pub trait DeliveryStream: Send {
    /// Receive the next delivery, waiting until one is available
    async fn next(&mut self) -> Result<Option<Delivery>>;
}

type AckFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;
type RequeueFn = Box<dyn FnOnce(u32) -> BoxFuture<'static, Result<()>> + Send>;
type RejectFn = Box<dyn FnOnce(String) -> BoxFuture<'static, Result<()>> + Send>;

/// A message pending acknowledgement
///
/// Exactly one of `ack`, `requeue`, or `dead_letter` must be called.
pub struct Delivery {
    /// The received message
    pub message: InboundMessage,

    ack_fn: AckFn,
    requeue_fn: RequeueFn,
    reject_fn: RejectFn,
}

impl Delivery {
    /// Create a delivery with ack/requeue/reject callbacks
    pub fn new(
        message: InboundMessage,
        ack_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
        requeue_fn: impl FnOnce(u32) -> BoxFuture<'static, Result<()>> + Send + 'static,
        reject_fn: impl FnOnce(String) -> BoxFuture<'static, Result<()>> + Send + 'static,
    ) -> Self {
        Self {
            message,
            ack_fn: Box::new(ack_fn),
            requeue_fn: Box::new(requeue_fn),
            reject_fn: Box::new(reject_fn),
        }
    }

    /// Acknowledge successful processing
    pub async fn ack(self) -> Result<()> {
        (self.ack_fn)().await
    }

    /// Return the message to its queue carrying `attempt_count`
    pub async fn requeue(self, attempt_count: u32) -> Result<()> {
        (self.requeue_fn)(attempt_count).await
    }

    /// Reject without requeue; the queue's dead-letter target receives it
    pub async fn dead_letter(self, reason: impl Into<String>) -> Result<()> {
        (self.reject_fn)(reason.into()).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Fail fast on queues that were never declared
pub(crate) fn unknown_queue(queue: &str) -> AuditError {
    AuditError::Consume {
        queue: queue.to_string(),
        reason: "queue not declared".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_attempt_count() {
        assert_eq!(parse_attempt_count(None), 0);
        assert_eq!(parse_attempt_count(Some("3")), 3);
        assert_eq!(parse_attempt_count(Some(" 2 ")), 2);
        assert_eq!(parse_attempt_count(Some("-1")), 0);
        assert_eq!(parse_attempt_count(Some("abc")), 0);
    }

    #[test]
    fn test_outbound_message_for_envelope() {
        let topology = Topology::default();
        let record = AuditRecord::new("alice", "login", "Auth", "login").with_trace_id("t1");
        let envelope = RetryEnvelope::new(record).retried();

        let message = OutboundMessage::for_envelope(&topology, &envelope).unwrap();
        assert_eq!(message.exchange, topology.exchange);
        assert_eq!(message.routing_key, topology.routing_key);
        assert_eq!(message.correlation_id, "t1");
        assert_eq!(message.attempt_count, 1);

        // The attempt counter never leaks into the body
        let body: serde_json::Value = serde_json::from_slice(&message.body).unwrap();
        assert_eq!(body["traceId"], "t1");
        assert!(body.get("attemptCount").is_none());
    }

    #[test]
    fn test_inbound_message_decodes_envelope() {
        let record = AuditRecord::new("bob", "delete", "Users", "delete").with_trace_id("t2");
        let message = InboundMessage {
            queue: "q".to_string(),
            correlation_id: Some("t2".to_string()),
            attempt_count: 2,
            death_reason: None,
            body: serde_json::to_vec(&record).unwrap().into(),
        };

        let envelope = message.envelope().unwrap();
        assert_eq!(envelope.attempt_count, 2);
        assert_eq!(envelope.record, record);
    }

    #[test]
    fn test_inbound_message_rejects_garbage() {
        let message = InboundMessage {
            queue: "q".to_string(),
            correlation_id: None,
            attempt_count: 0,
            death_reason: None,
            body: Bytes::from_static(b"not json"),
        };
        assert!(matches!(message.envelope(), Err(AuditError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_delivery_callbacks() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let seen = Arc::new(AtomicU32::new(0));
        let seen_requeue = seen.clone();
        let message = InboundMessage {
            queue: "q".to_string(),
            correlation_id: None,
            attempt_count: 0,
            death_reason: None,
            body: Bytes::new(),
        };

        let delivery = Delivery::new(
            message,
            || Box::pin(async { Ok(()) }),
            move |attempt| {
                Box::pin(async move {
                    seen_requeue.store(attempt, Ordering::SeqCst);
                    Ok(())
                })
            },
            |_reason| Box::pin(async { Ok(()) }),
        );

        delivery.requeue(4).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }
}
