//! NATS pull subscription with manual settlement

use super::client::{build_headers, QueueRoute};
use crate::error::{AuditError, Result};
use crate::provider::{
    parse_attempt_count, Delivery, DeliveryStream, InboundMessage, ATTEMPT_COUNT_HEADER,
    CORRELATION_ID_HEADER, DEATH_REASON_HEADER,
};
use async_nats::jetstream;
use async_nats::jetstream::AckKind;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;

/// Pull-based subscription on a queue's durable consumer
pub struct NatsSubscription {
    messages: jetstream::consumer::pull::Stream,
    queue: String,
    route: QueueRoute,
    jetstream: jetstream::Context,
}

impl NatsSubscription {
    pub(crate) fn new(
        messages: jetstream::consumer::pull::Stream,
        queue: String,
        route: QueueRoute,
        jetstream: jetstream::Context,
    ) -> Self {
        Self {
            messages,
            queue,
            route,
            jetstream,
        }
    }
}

fn header(msg: &jetstream::Message, name: &str) -> Option<String> {
    msg.headers
        .as_ref()
        .and_then(|h| h.get(name))
        .map(|v| v.as_str().to_string())
}

/// Republish `body` to `subject` and wait for the stream to store it
async fn republish(
    js: &jetstream::Context,
    subject: String,
    headers: async_nats::HeaderMap,
    body: bytes::Bytes,
) -> Result<()> {
    js.publish_with_headers(subject.clone(), headers, body)
        .await
        .map_err(|e| AuditError::Ack(format!("republish to '{}': {}", subject, e)))?
        .await
        .map_err(|e| AuditError::Ack(format!("republish to '{}' not stored: {}", subject, e)))?;
    Ok(())
}

#[async_trait]
impl DeliveryStream for NatsSubscription {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        let msg = match self.messages.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                return Err(AuditError::Consume {
                    queue: self.queue.clone(),
                    reason: e.to_string(),
                })
            }
            None => return Ok(None),
        };

        let correlation_id = header(&msg, CORRELATION_ID_HEADER);
        let message = InboundMessage {
            queue: self.queue.clone(),
            correlation_id: correlation_id.clone(),
            attempt_count: parse_attempt_count(header(&msg, ATTEMPT_COUNT_HEADER).as_deref()),
            death_reason: header(&msg, DEATH_REASON_HEADER),
            body: msg.payload.clone(),
        };

        let msg = Arc::new(msg);
        let ack_msg = msg.clone();
        let requeue_msg = msg.clone();
        let reject_msg = msg;

        let requeue_js = self.jetstream.clone();
        let requeue_subject = self.route.subject.clone();
        let requeue_correlation = correlation_id.clone();
        let requeue_death_reason = message.death_reason.clone();

        let reject_js = self.jetstream.clone();
        let dead_letter_subject = self.route.dead_letter_subject.clone();
        let reject_queue = self.queue.clone();

        Ok(Some(Delivery::new(
            message,
            move || {
                Box::pin(async move {
                    ack_msg
                        .ack()
                        .await
                        .map_err(|e| AuditError::Ack(e.to_string()))
                })
            },
            // Work-queue streams keep no per-message counter we can raise, so a
            // requeue stores a fresh copy with the new attempt and acks the old one
            move |attempt_count| {
                Box::pin(async move {
                    let headers = build_headers(
                        requeue_correlation.as_deref(),
                        attempt_count,
                        requeue_death_reason.as_deref(),
                    );
                    republish(
                        &requeue_js,
                        requeue_subject,
                        headers,
                        requeue_msg.payload.clone(),
                    )
                    .await?;
                    requeue_msg
                        .ack()
                        .await
                        .map_err(|e| AuditError::Ack(e.to_string()))
                })
            },
            move |reason| {
                Box::pin(async move {
                    match dead_letter_subject {
                        Some(subject) => {
                            let attempt = parse_attempt_count(
                                header(&reject_msg, ATTEMPT_COUNT_HEADER).as_deref(),
                            );
                            let headers = build_headers(
                                correlation_id.as_deref(),
                                attempt,
                                Some(&reason),
                            );
                            republish(&reject_js, subject, headers, reject_msg.payload.clone())
                                .await?;
                        }
                        None => {
                            tracing::warn!(
                                queue = %reject_queue,
                                reason = %reason,
                                "Queue has no dead-letter route, discarding message"
                            );
                        }
                    }
                    reject_msg
                        .ack_with(AckKind::Term)
                        .await
                        .map_err(|e| AuditError::Ack(e.to_string()))
                })
            },
        )))
    }
}
