//! NATS JetStream client: connect, declare, publish, consume

use super::config::{NatsConfig, StorageType};
use super::subscriber::NatsSubscription;
use crate::error::{AuditError, Result};
use crate::provider::{
    unknown_queue, Confirmation, OutboundMessage, PendingConfirm, ATTEMPT_COUNT_HEADER,
    CORRELATION_ID_HEADER, DEATH_REASON_HEADER,
};
use crate::topology::Topology;
use async_nats::jetstream;
use async_nats::jetstream::context::PublishErrorKind;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Where a declared queue lives in JetStream
#[derive(Debug, Clone)]
pub(crate) struct QueueRoute {
    /// Stream holding the queue's messages
    pub stream_name: String,

    /// Subject that feeds the queue; requeues are published here
    pub subject: String,

    /// Subject of the dead-letter route, if the queue has one
    pub dead_letter_subject: Option<String>,
}

/// NATS JetStream client
///
/// Maps exchanges and routing keys onto subjects and each queue onto a
/// work-queue stream, so every message is delivered to one consumer and
/// removed once acknowledged.
pub struct NatsClient {
    /// JetStream context over the connection
    jetstream: jetstream::Context,

    /// Declared queues (queue name → route)
    routes: RwLock<HashMap<String, QueueRoute>>,

    /// Configuration
    config: Arc<NatsConfig>,
}

impl NatsClient {
    /// Connect to NATS
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let connect_opts = build_connect_options(&config);

        let client = connect_opts
            .connect(&config.url)
            .await
            .map_err(|e| AuditError::Connection(format!("{}: {}", config.url, e)))?;

        tracing::info!(url = %config.url, "Connected to NATS");

        let jetstream = jetstream::new(client);

        Ok(Self {
            jetstream,
            routes: RwLock::new(HashMap::new()),
            config: Arc::new(config),
        })
    }

    /// Create or verify one stream per queue
    pub async fn declare(&self, topology: &Topology) -> Result<()> {
        topology.validate()?;
        let bindings = topology.bindings();

        let mut declared = HashMap::new();
        for queue in topology.queues() {
            let subjects: Vec<String> = bindings
                .iter()
                .filter(|b| b.queue == queue.name)
                .map(|b| self.config.subject(&b.exchange, &b.routing_key))
                .collect();

            let Some(subject) = subjects.first().cloned() else {
                return Err(AuditError::Topology(format!(
                    "queue '{}' has no binding",
                    queue.name
                )));
            };

            let stream_name = self.config.stream_name(&queue.name);
            ensure_stream(&self.jetstream, &self.config, &stream_name, subjects).await?;

            declared.insert(
                queue.name.clone(),
                QueueRoute {
                    stream_name,
                    subject,
                    dead_letter_subject: queue
                        .dead_letter
                        .as_ref()
                        .map(|t| self.config.subject(&t.exchange, &t.routing_key)),
                },
            );
        }

        self.routes.write().await.extend(declared);
        Ok(())
    }

    /// Publish a message; the returned future resolves with the broker's answer
    pub async fn publish(&self, message: OutboundMessage) -> Result<PendingConfirm> {
        let subject = self.config.subject(&message.exchange, &message.routing_key);
        let headers = build_headers(
            Some(&message.correlation_id),
            message.attempt_count,
            None,
        );

        let ack_fut = self
            .jetstream
            .publish_with_headers(subject.clone(), headers, message.body)
            .await
            .map_err(|e| AuditError::Publish {
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                reason: e.to_string(),
            })?;

        tracing::debug!(
            subject = %subject,
            correlation_id = %message.correlation_id,
            attempt_count = message.attempt_count,
            "Message handed to JetStream"
        );

        let exchange = message.exchange;
        let routing_key = message.routing_key;
        Ok(Box::pin(async move {
            match ack_fut.await {
                Ok(_) => Confirmation::Ack,
                // No stream captures the subject: nothing is bound to this key
                Err(e) if matches!(e.kind(), PublishErrorKind::StreamNotFound) => {
                    Confirmation::Returned {
                        exchange,
                        routing_key,
                        reply_text: e.to_string(),
                    }
                }
                Err(e) => Confirmation::Nack {
                    reason: e.to_string(),
                },
            }
        }))
    }

    /// Open a pull subscription on the queue's shared durable consumer
    pub async fn consume(&self, queue: &str) -> Result<NatsSubscription> {
        let route = self
            .routes
            .read()
            .await
            .get(queue)
            .cloned()
            .ok_or_else(|| unknown_queue(queue))?;

        let stream = self
            .jetstream
            .get_stream(&route.stream_name)
            .await
            .map_err(|e| AuditError::Consume {
                queue: queue.to_string(),
                reason: format!("stream '{}': {}", route.stream_name, e),
            })?;

        let consumer_name = self.config.consumer_name(queue);
        let consumer = stream
            .get_or_create_consumer(
                &consumer_name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(consumer_name.clone()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: Duration::from_secs(self.config.ack_wait_secs),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| AuditError::Consume {
                queue: queue.to_string(),
                reason: format!("consumer '{}': {}", consumer_name, e),
            })?;

        let messages = consumer.messages().await.map_err(|e| AuditError::Consume {
            queue: queue.to_string(),
            reason: e.to_string(),
        })?;

        tracing::info!(
            queue = queue,
            consumer = %consumer_name,
            stream = %route.stream_name,
            "Durable subscription created"
        );

        Ok(NatsSubscription::new(
            messages,
            queue.to_string(),
            route,
            self.jetstream.clone(),
        ))
    }

    /// Messages currently stored in the queue's stream
    pub async fn queue_depth(&self, queue: &str) -> Result<u64> {
        let stream_name = self
            .routes
            .read()
            .await
            .get(queue)
            .map(|r| r.stream_name.clone())
            .ok_or_else(|| unknown_queue(queue))?;

        let mut stream = self
            .jetstream
            .get_stream(&stream_name)
            .await
            .map_err(|e| AuditError::Connection(format!("stream '{}': {}", stream_name, e)))?;
        let info = stream
            .info()
            .await
            .map_err(|e| AuditError::Connection(format!("stream '{}' info: {}", stream_name, e)))?;

        Ok(info.state.messages)
    }

    /// Get the JetStream context
    pub fn jetstream_context(&self) -> &jetstream::Context {
        &self.jetstream
    }
}

/// Build message headers carrying retry and correlation metadata
pub(crate) fn build_headers(
    correlation_id: Option<&str>,
    attempt_count: u32,
    death_reason: Option<&str>,
) -> async_nats::HeaderMap {
    let mut headers = async_nats::HeaderMap::new();
    headers.insert(ATTEMPT_COUNT_HEADER, attempt_count.to_string().as_str());
    if let Some(correlation_id) = correlation_id {
        headers.insert(CORRELATION_ID_HEADER, correlation_id);
    }
    if let Some(reason) = death_reason {
        headers.insert(DEATH_REASON_HEADER, reason);
    }
    headers
}

/// Build NATS connect options from config
fn build_connect_options(config: &NatsConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}

/// Stream config for a queue: work-queue retention, no max age
fn queue_stream_config(
    config: &NatsConfig,
    stream_name: &str,
    subjects: Vec<String>,
) -> jetstream::stream::Config {
    let storage = match config.storage {
        StorageType::File => jetstream::stream::StorageType::File,
        StorageType::Memory => jetstream::stream::StorageType::Memory,
    };

    jetstream::stream::Config {
        name: stream_name.to_string(),
        subjects,
        storage,
        retention: jetstream::stream::RetentionPolicy::WorkQueue,
        max_age: Duration::ZERO,
        ..Default::default()
    }
}

/// Describe how an existing stream differs from the wanted one, if at all
pub(crate) fn stream_mismatch(
    wanted: &jetstream::stream::Config,
    existing: &jetstream::stream::Config,
) -> Option<String> {
    let mut wanted_subjects = wanted.subjects.clone();
    let mut existing_subjects = existing.subjects.clone();
    wanted_subjects.sort();
    existing_subjects.sort();

    if wanted_subjects != existing_subjects {
        return Some(format!(
            "subjects {:?} != {:?}",
            existing_subjects, wanted_subjects
        ));
    }
    if wanted.retention != existing.retention {
        return Some(format!(
            "retention {:?} != {:?}",
            existing.retention, wanted.retention
        ));
    }
    if wanted.storage != existing.storage {
        return Some(format!(
            "storage {:?} != {:?}",
            existing.storage, wanted.storage
        ));
    }
    if wanted.max_age != existing.max_age {
        return Some(format!(
            "max_age {:?} != {:?}",
            existing.max_age, wanted.max_age
        ));
    }
    None
}

/// Ensure the queue's stream exists with a compatible configuration
async fn ensure_stream(
    js: &jetstream::Context,
    config: &NatsConfig,
    stream_name: &str,
    subjects: Vec<String>,
) -> Result<jetstream::stream::Stream> {
    let wanted = queue_stream_config(config, stream_name, subjects);

    let stream = js
        .get_or_create_stream(wanted.clone())
        .await
        .map_err(|e| AuditError::Topology(format!(
            "Failed to create/get stream '{}': {}",
            stream_name, e
        )))?;

    if let Some(diff) = stream_mismatch(&wanted, &stream.cached_info().config) {
        return Err(AuditError::Topology(format!(
            "stream '{}' already declared with different arguments: {}",
            stream_name, diff
        )));
    }

    tracing::info!(
        stream = %stream_name,
        subjects = ?wanted.subjects,
        "JetStream queue stream ready"
    );

    Ok(stream)
}
