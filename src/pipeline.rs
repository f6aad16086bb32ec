//! High-level audit pipeline wiring every component together
//!
//! `AuditPipeline` declares the topology, prepares the search index, starts
//! the publisher and the consumer workers, and exposes the write and read
//! paths behind one handle.

use crate::config::{AuditConfig, BrokerKind};
use crate::consumer::{AuditConsumer, ConsumeReport, RetryPolicy};
use crate::dlq::{DeadLetterReplayer, ReplayReport};
use crate::error::Result;
use crate::indexer::Indexer;
use crate::provider::memory::MemoryBroker;
use crate::provider::nats::NatsBroker;
use crate::provider::BrokerProvider;
use crate::publisher::{AuditPublisher, PublisherCounts};
use crate::query::{AuditQueryService, SearchOutcome};
use crate::recorder::AuditRecorder;
use crate::sink::{ElasticsearchSink, SearchSink};
use crate::store::{AuditStore, SqliteAuditStore};
use crate::topology::Topology;
use crate::types::{AuditFilter, AuditRecord, Page, PageRequest};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Running audit pipeline
pub struct AuditPipeline {
    broker: Arc<dyn BrokerProvider>,
    topology: Topology,
    publisher: Arc<AuditPublisher>,
    query: AuditQueryService,
    recorder: AuditRecorder,
    replayer: DeadLetterReplayer,
    idle_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<ConsumeReport>>>,
}

impl AuditPipeline {
    /// Start the pipeline on already-connected backends
    ///
    /// A topology that cannot be declared is fatal. A search index that
    /// cannot be created is logged; indexing failures then go through the
    /// normal retry path.
    pub async fn start(
        broker: Arc<dyn BrokerProvider>,
        sink: Arc<dyn SearchSink>,
        store: Arc<dyn AuditStore>,
        config: &AuditConfig,
    ) -> Result<Self> {
        config.validate()?;
        let topology = config.topology.clone();

        broker.declare(&topology).await?;

        let indexer = Indexer::new(sink.clone())
            .with_timeout(Duration::from_millis(config.consumer.index_timeout_ms));
        if let Err(e) = indexer.ensure_index().await {
            tracing::warn!(sink = sink.name(), error = %e, "Search index not ready");
        }

        let publisher = Arc::new(AuditPublisher::start(
            broker.clone(),
            topology.clone(),
            config.publisher.clone(),
        ));

        let consumer = AuditConsumer::new(broker.clone(), indexer, &topology)
            .with_policy(RetryPolicy::new(config.consumer.max_retry));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = consumer
            .spawn_workers(config.consumer.workers, shutdown_rx)
            .await?;

        let query = AuditQueryService::new(sink.clone(), store.clone())
            .with_config(config.query.clone());
        let recorder = AuditRecorder::new(store, publisher.clone());
        let replayer = DeadLetterReplayer::new(broker.clone(), topology.clone())
            .with_confirm_timeout(Duration::from_millis(config.publisher.confirm_timeout_ms));

        tracing::info!(
            broker = broker.name(),
            sink = sink.name(),
            exchange = %topology.exchange,
            work_queue = %topology.work_queue,
            "Audit pipeline started"
        );

        Ok(Self {
            broker,
            topology,
            publisher,
            query,
            recorder,
            replayer,
            idle_timeout: Duration::from_millis(config.consumer.idle_timeout_ms),
            shutdown_tx,
            workers: Mutex::new(workers),
        })
    }

    /// Connect the configured backends, then start
    pub async fn from_config(config: &AuditConfig) -> Result<Self> {
        let broker: Arc<dyn BrokerProvider> = match config.broker {
            BrokerKind::Nats => Arc::new(NatsBroker::connect(config.nats.clone()).await?),
            BrokerKind::Memory => Arc::new(MemoryBroker::new()),
        };
        let sink = Arc::new(ElasticsearchSink::new(config.elasticsearch.clone())?);
        let store = Arc::new(SqliteAuditStore::connect(&config.database).await?);

        Self::start(broker, sink, store, config).await
    }

    /// Queue a record for indexing; never blocks
    pub fn emit(&self, record: AuditRecord) -> bool {
        self.publisher.emit(record)
    }

    /// Recorder that persists and emits around audited calls
    pub fn recorder(&self) -> &AuditRecorder {
        &self.recorder
    }

    pub async fn search(
        &self,
        keyword: Option<&str>,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Vec<AuditRecord> {
        self.query.search(keyword, start_time, end_time).await
    }

    pub async fn search_with_source(&self, filter: &AuditFilter) -> SearchOutcome {
        self.query.search_with_source(filter).await
    }

    pub async fn page(&self, filter: &AuditFilter, request: PageRequest) -> Page<AuditRecord> {
        self.query.page(filter, request).await
    }

    /// Move up to `limit` dead letters back to the work queue
    pub async fn replay_dlq(&self, limit: usize) -> Result<ReplayReport> {
        self.replayer.replay(limit, self.idle_timeout).await
    }

    pub fn publisher_stats(&self) -> PublisherCounts {
        self.publisher.stats()
    }

    /// Wait for every emitted record to be confirmed, returned, or failed
    pub async fn wait_published(&self, timeout: Duration) -> bool {
        self.publisher.wait_settled(timeout).await
    }

    pub async fn queue_depth(&self, queue: &str) -> Result<u64> {
        self.broker.queue_depth(queue).await
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Flush the publisher, then stop the workers and collect their reports
    pub async fn shutdown(&self) -> ConsumeReport {
        self.publisher.shutdown().await;
        let _ = self.shutdown_tx.send(true);

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();

        let mut report = ConsumeReport::default();
        for worker in workers {
            match worker.await {
                Ok(worker_report) => report.merge(&worker_report),
                Err(e) => tracing::error!(error = %e, "Consumer worker failed"),
            }
        }

        tracing::info!(
            acked = report.acked,
            requeued = report.requeued,
            dead_lettered = report.dead_lettered,
            "Audit pipeline stopped"
        );
        report
    }
}
