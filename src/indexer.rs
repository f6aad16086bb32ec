//! Indexer: writes audit records into a search sink idempotently

use crate::error::{IndexError, Result};
use crate::sink::{AuditDocument, SearchSink};
use crate::types::AuditRecord;
use std::sync::Arc;
use std::time::Duration;

/// Default bound on a single index write
pub const DEFAULT_INDEX_TIMEOUT: Duration = Duration::from_secs(5);

/// Writes records under their deterministic document id
///
/// A record is keyed by its store id, or its trace id when it has none, so
/// redelivering the same record overwrites instead of duplicating.
#[derive(Clone)]
pub struct Indexer {
    sink: Arc<dyn SearchSink>,
    timeout: Duration,
}

impl Indexer {
    pub fn new(sink: Arc<dyn SearchSink>) -> Self {
        Self {
            sink,
            timeout: DEFAULT_INDEX_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Create the target index if absent; run once at startup
    pub async fn ensure_index(&self) -> Result<()> {
        self.sink.ensure_index().await
    }

    /// Index one record
    pub async fn index(&self, record: &AuditRecord) -> std::result::Result<(), IndexError> {
        let doc_id = record.document_id();
        if doc_id.is_empty() {
            return Err(IndexError::Rejected {
                doc_id,
                status: 0,
                reason: "record has neither id nor traceId".to_string(),
            });
        }

        let document = AuditDocument::from_record(record);
        match tokio::time::timeout(self.timeout, self.sink.upsert(&doc_id, &document)).await {
            Ok(Ok(())) => {
                tracing::debug!(doc_id = %doc_id, sink = self.sink.name(), "Record indexed");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(IndexError::Timeout(self.timeout.as_millis() as u64)),
        }
    }

    pub fn sink(&self) -> &Arc<dyn SearchSink> {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySearchSink;

    fn record() -> AuditRecord {
        AuditRecord::new("alice", "login", "Auth", "login").with_trace_id("t1")
    }

    #[tokio::test]
    async fn test_index_is_idempotent() {
        let sink = MemorySearchSink::new();
        let indexer = Indexer::new(Arc::new(sink.clone()));

        indexer.index(&record()).await.unwrap();
        indexer.index(&record()).await.unwrap();

        assert_eq!(sink.len(), 1);
        assert_eq!(sink.get("t1").unwrap().username, "alice");
    }

    #[tokio::test]
    async fn test_index_prefers_store_id() {
        let sink = MemorySearchSink::new();
        let indexer = Indexer::new(Arc::new(sink.clone()));

        let mut record = record();
        record.id = Some(42);
        indexer.index(&record).await.unwrap();

        assert!(sink.get("42").is_some());
        assert!(sink.get("t1").is_none());
    }

    #[tokio::test]
    async fn test_index_timeout() {
        let sink = MemorySearchSink::new();
        sink.set_write_latency(Some(Duration::from_millis(200)));
        let indexer = Indexer::new(Arc::new(sink.clone())).with_timeout(Duration::from_millis(20));

        let result = indexer.index(&record()).await;
        assert!(matches!(result, Err(IndexError::Timeout(20))));
    }

    #[tokio::test]
    async fn test_index_surfaces_sink_errors() {
        let sink = MemorySearchSink::new();
        sink.set_available(false);
        let indexer = Indexer::new(Arc::new(sink));

        let result = indexer.index(&record()).await;
        assert!(matches!(result, Err(IndexError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_index_requires_a_key() {
        let indexer = Indexer::new(Arc::new(MemorySearchSink::new()));
        let record = AuditRecord::new("alice", "login", "Auth", "login");
        assert!(matches!(
            indexer.index(&record).await,
            Err(IndexError::Rejected { .. })
        ));
    }
}
