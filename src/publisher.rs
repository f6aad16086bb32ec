//! Fire-and-forget audit publisher
//!
//! `emit` hands a record to a bounded in-process queue and returns at once.
//! A background task publishes each record to the work exchange and spawns
//! a watcher per message that logs the broker's confirm or return.

use crate::provider::{BrokerProvider, Confirmation, OutboundMessage};
use crate::topology::Topology;
use crate::types::{AuditRecord, RetryEnvelope};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::{JoinHandle, JoinSet};

/// Publisher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Records buffered between `emit` and the broker
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Bound on handing one message to the broker client
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    /// Bound on waiting for the broker's confirm
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_publish_timeout_ms() -> u64 {
    5000
}

fn default_confirm_timeout_ms() -> u64 {
    5000
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            publish_timeout_ms: default_publish_timeout_ms(),
            confirm_timeout_ms: default_confirm_timeout_ms(),
        }
    }
}

/// Publish outcome counters
#[derive(Debug, Default)]
pub struct PublisherStats {
    accepted: AtomicU64,
    confirmed: AtomicU64,
    returned: AtomicU64,
    nacked: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of [`PublisherStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublisherCounts {
    /// Taken into the hand-off queue
    pub accepted: u64,
    /// Routed and confirmed by the broker
    pub confirmed: u64,
    /// Reached the exchange but matched no binding
    pub returned: u64,
    /// Refused by the broker
    pub nacked: u64,
    /// Broker unreachable, timed out, or unencodable
    pub failed: u64,
    /// Never queued: hand-off queue full or publisher shut down
    pub dropped: u64,
}

impl PublisherCounts {
    /// Accepted records whose outcome is known
    pub fn settled(&self) -> u64 {
        self.confirmed + self.returned + self.nacked + self.failed
    }
}

impl PublisherStats {
    pub fn snapshot(&self) -> PublisherCounts {
        PublisherCounts {
            accepted: self.accepted.load(Ordering::Relaxed),
            confirmed: self.confirmed.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Non-blocking publisher of audit records
pub struct AuditPublisher {
    tx: Mutex<Option<mpsc::Sender<AuditRecord>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<PublisherStats>,
}

impl AuditPublisher {
    /// Start the background publish task
    pub fn start(
        broker: Arc<dyn BrokerProvider>,
        topology: Topology,
        config: PublisherConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let stats = Arc::new(PublisherStats::default());

        let worker = tokio::spawn(Self::background_task(
            rx,
            broker,
            topology,
            config,
            stats.clone(),
        ));

        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            stats,
        }
    }

    /// Queue a record for publishing
    ///
    /// Assigns a trace id if the record has none. Never blocks and never
    /// fails; returns `false` if the record was dropped.
    pub fn emit(&self, mut record: AuditRecord) -> bool {
        record.ensure_trace_id();

        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            PublisherStats::bump(&self.stats.dropped);
            tracing::warn!(trace_id = %record.trace_id, "Publisher shut down, audit record dropped");
            return false;
        };

        match tx.try_send(record) {
            Ok(()) => {
                PublisherStats::bump(&self.stats.accepted);
                true
            }
            Err(TrySendError::Full(record)) => {
                PublisherStats::bump(&self.stats.dropped);
                tracing::warn!(trace_id = %record.trace_id, "Publish queue full, audit record dropped");
                false
            }
            Err(TrySendError::Closed(record)) => {
                PublisherStats::bump(&self.stats.dropped);
                tracing::warn!(trace_id = %record.trace_id, "Publish queue closed, audit record dropped");
                false
            }
        }
    }

    /// Same as [`emit`](Self::emit)
    pub fn publish(&self, record: AuditRecord) -> bool {
        self.emit(record)
    }

    pub fn stats(&self) -> PublisherCounts {
        self.stats.snapshot()
    }

    /// Wait until every accepted record has a known outcome
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_settled(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let counts = self.stats();
            if counts.settled() >= counts.accepted {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Stop accepting records, then wait for queued publishes and confirms
    pub async fn shutdown(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Publisher task failed");
            }
        }
    }

    async fn background_task(
        mut rx: mpsc::Receiver<AuditRecord>,
        broker: Arc<dyn BrokerProvider>,
        topology: Topology,
        config: PublisherConfig,
        stats: Arc<PublisherStats>,
    ) {
        let publish_timeout = Duration::from_millis(config.publish_timeout_ms);
        let confirm_timeout = Duration::from_millis(config.confirm_timeout_ms);
        let mut confirms = JoinSet::new();

        loop {
            tokio::select! {
                record = rx.recv() => {
                    let Some(record) = record else { break };
                    publish_one(
                        &broker,
                        &topology,
                        record,
                        publish_timeout,
                        confirm_timeout,
                        &stats,
                        &mut confirms,
                    )
                    .await;
                }
                Some(_) = confirms.join_next(), if !confirms.is_empty() => {}
            }
        }

        while confirms.join_next().await.is_some() {}
        tracing::debug!("Publisher drained");
    }
}

async fn publish_one(
    broker: &Arc<dyn BrokerProvider>,
    topology: &Topology,
    record: AuditRecord,
    publish_timeout: Duration,
    confirm_timeout: Duration,
    stats: &Arc<PublisherStats>,
    confirms: &mut JoinSet<()>,
) {
    let trace_id = record.trace_id.clone();
    let message = match OutboundMessage::for_envelope(topology, &RetryEnvelope::new(record)) {
        Ok(message) => message,
        Err(e) => {
            PublisherStats::bump(&stats.failed);
            tracing::error!(trace_id = %trace_id, error = %e, "Failed to encode audit record");
            return;
        }
    };

    let pending = match tokio::time::timeout(publish_timeout, broker.publish(message)).await {
        Ok(Ok(pending)) => pending,
        Ok(Err(e)) => {
            PublisherStats::bump(&stats.failed);
            tracing::warn!(
                trace_id = %trace_id,
                broker = broker.name(),
                error = %e,
                "Broker unavailable, audit record dropped"
            );
            return;
        }
        Err(_) => {
            PublisherStats::bump(&stats.failed);
            tracing::warn!(
                trace_id = %trace_id,
                timeout_ms = publish_timeout.as_millis() as u64,
                "Publish timed out, audit record dropped"
            );
            return;
        }
    };

    let stats = stats.clone();
    confirms.spawn(async move {
        match tokio::time::timeout(confirm_timeout, pending).await {
            Ok(Confirmation::Ack) => {
                PublisherStats::bump(&stats.confirmed);
                tracing::debug!(correlation_id = %trace_id, "Publish confirmed");
            }
            Ok(Confirmation::Nack { reason }) => {
                PublisherStats::bump(&stats.nacked);
                tracing::error!(correlation_id = %trace_id, reason = %reason, "Publish nacked by broker");
            }
            Ok(Confirmation::Returned {
                exchange,
                routing_key,
                reply_text,
            }) => {
                PublisherStats::bump(&stats.returned);
                tracing::error!(
                    correlation_id = %trace_id,
                    exchange = %exchange,
                    routing_key = %routing_key,
                    reply_text = %reply_text,
                    "Publish returned: no queue bound for routing key"
                );
            }
            Err(_) => {
                PublisherStats::bump(&stats.failed);
                tracing::warn!(correlation_id = %trace_id, "No confirm before timeout");
            }
        }
    });
}
