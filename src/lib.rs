//! # a3s-audit
//!
//! Asynchronous audit-event pipeline: capture, broker, index, and query.
//!
//! ## Overview
//!
//! Audited operations produce an [`AuditRecord`]. The record is written to a
//! relational store, then emitted through a non-blocking publisher to a
//! durable work queue. Consumer workers index each record into a search
//! sink, retrying a bounded number of times before the broker dead-letters
//! it. Reads go to the search sink first and fall back to the relational
//! store when the sink is down or has nothing.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_audit::{AuditConfig, AuditPipeline, AuditRecord};
//! use a3s_audit::provider::memory::MemoryBroker;
//! use a3s_audit::sink::MemorySearchSink;
//! use a3s_audit::store::MemoryAuditStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> a3s_audit::Result<()> {
//! let pipeline = AuditPipeline::start(
//!     Arc::new(MemoryBroker::new()),
//!     Arc::new(MemorySearchSink::new()),
//!     Arc::new(MemoryAuditStore::new()),
//!     &AuditConfig::default(),
//! )
//! .await?;
//!
//! pipeline.emit(AuditRecord::new("alice", "login", "AuthService", "login"));
//!
//! let hits = pipeline.search(Some("alice"), None, None).await;
//! println!("{} records", hits.len());
//!
//! pipeline.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Brokers
//!
//! - **memory**: in-process exchanges, queues, and dead-letter routing
//! - **nats**: NATS JetStream work-queue streams
//!
//! ## Architecture
//!
//! - **BrokerProvider** trait: topology, publish with confirm, manual-ack consume
//! - **AuditPublisher**: fire-and-forget hand-off with confirm/return tracking
//! - **AuditConsumer**: index, requeue with attempt count, dead-letter
//! - **Indexer** / **SearchSink**: idempotent writes keyed by id or trace id
//! - **AuditQueryService**: search sink first, relational store fallback
//! - **AuditRecorder**: wraps an audited call and records its outcome

pub mod config;
pub mod consumer;
pub mod dlq;
pub mod error;
pub mod indexer;
pub mod pipeline;
pub mod provider;
pub mod publisher;
pub mod query;
pub mod recorder;
pub mod sink;
pub mod store;
pub mod topology;
pub mod types;

// Re-export core types
pub use config::{AuditConfig, BrokerKind, ConsumerConfig};
pub use consumer::{AuditConsumer, ConsumeReport, Disposition, RetryPolicy};
pub use dlq::{DeadLetterReplayer, ReplayReport};
pub use error::{AuditError, IndexError, Result};
pub use indexer::Indexer;
pub use pipeline::AuditPipeline;
pub use provider::{BrokerProvider, Confirmation, Delivery, DeliveryStream};
pub use publisher::{AuditPublisher, PublisherConfig, PublisherCounts};
pub use query::{AuditQueryService, QueryConfig, QuerySource, SearchOutcome};
pub use recorder::{AuditRecorder, CallSite, RequestContext};
pub use sink::{AuditDocument, SearchSink};
pub use store::AuditStore;
pub use topology::Topology;
pub use types::{AuditFilter, AuditRecord, Page, PageRequest, RetryEnvelope};

// Re-export providers for convenience
pub use provider::memory::MemoryBroker;
pub use provider::nats::{NatsBroker, NatsClient, NatsConfig, NatsSubscription, StorageType};
