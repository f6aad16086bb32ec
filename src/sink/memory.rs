//! In-memory search sink for testing and local runs

use super::{AuditDocument, SearchSink};
use crate::error::{AuditError, IndexError, Result};
use crate::types::{AuditFilter, AuditRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Default)]
struct SinkState {
    documents: HashMap<String, AuditDocument>,
    index_created: bool,
    latency: Option<Duration>,
    search_latency: Option<Duration>,
}

/// In-memory search sink
///
/// Cloning shares the same documents. Outages and transient write failures
/// can be injected to exercise the retry and fallback paths.
#[derive(Clone, Default)]
pub struct MemorySearchSink {
    state: Arc<Mutex<SinkState>>,
    unavailable: Arc<AtomicBool>,
    fail_next: Arc<AtomicU32>,
    write_attempts: Arc<AtomicU64>,
}

impl MemorySearchSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: writes and searches fail until re-enabled
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Make the next `n` writes fail as unavailable
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Delay every write, for exercising write timeouts
    pub fn set_write_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Delay every search, for exercising query timeouts
    pub fn set_search_latency(&self, latency: Option<Duration>) {
        self.lock().search_latency = latency;
    }

    /// Number of stored documents
    pub fn len(&self) -> usize {
        self.lock().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored document by id
    pub fn get(&self, doc_id: &str) -> Option<AuditDocument> {
        self.lock().documents.get(doc_id).cloned()
    }

    /// Every write attempt, including failed ones
    pub fn write_attempts(&self) -> u64 {
        self.write_attempts.load(Ordering::SeqCst)
    }

    /// Whether `ensure_index` has run
    pub fn index_created(&self) -> bool {
        self.lock().index_created
    }

    fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::SeqCst)
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SearchSink for MemorySearchSink {
    async fn ensure_index(&self) -> Result<()> {
        if self.is_unavailable() {
            return Err(AuditError::Connection("memory search sink is down".to_string()));
        }
        self.lock().index_created = true;
        Ok(())
    }

    async fn upsert(
        &self,
        doc_id: &str,
        document: &AuditDocument,
    ) -> std::result::Result<(), IndexError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);

        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.is_unavailable() {
            return Err(IndexError::Unavailable("memory search sink is down".to_string()));
        }
        if self.take_injected_failure() {
            return Err(IndexError::Unavailable("injected write failure".to_string()));
        }

        self.lock()
            .documents
            .insert(doc_id.to_string(), document.clone());
        Ok(())
    }

    async fn search(&self, filter: &AuditFilter, limit: usize) -> Result<Vec<AuditRecord>> {
        let latency = self.lock().search_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.is_unavailable() {
            return Err(AuditError::Search("memory search sink is down".to_string()));
        }

        let documents: Vec<AuditDocument> = self.lock().documents.values().cloned().collect();
        let mut records = documents
            .into_iter()
            .map(AuditDocument::into_record)
            .collect::<Result<Vec<_>>>()?;

        records.retain(|r| filter.matches(r));
        records.sort_by(|a, b| b.create_time.cmp(&a.create_time));
        records.truncate(limit);
        Ok(records)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn doc(trace_id: &str, username: &str, minutes_ago: i64) -> AuditDocument {
        let record = AuditRecord::new(username, "login", "Auth", "login")
            .with_trace_id(trace_id)
            .with_create_time(Utc::now() - ChronoDuration::minutes(minutes_ago));
        AuditDocument::from_record(&record)
    }

    #[tokio::test]
    async fn test_upsert_overwrites_same_id() {
        let sink = MemorySearchSink::new();
        sink.upsert("t1", &doc("t1", "alice", 0)).await.unwrap();
        sink.upsert("t1", &doc("t1", "alice", 0)).await.unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.write_attempts(), 2);
    }

    #[test]
    fn test_ensure_index_marks_created() {
        let sink = MemorySearchSink::new();
        assert!(!sink.index_created());
        tokio_test::block_on(sink.ensure_index()).unwrap();
        assert!(sink.index_created());
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_search_newest_first_with_limit() {
        let sink = MemorySearchSink::new();
        sink.upsert("a", &doc("a", "alice", 30)).await.unwrap();
        sink.upsert("b", &doc("b", "alice", 10)).await.unwrap();
        sink.upsert("c", &doc("c", "alice", 20)).await.unwrap();

        let results = sink.search(&AuditFilter::default(), 2).await.unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.trace_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_search_filters_keyword() {
        let sink = MemorySearchSink::new();
        sink.upsert("a", &doc("a", "alice", 0)).await.unwrap();
        sink.upsert("b", &doc("b", "bob", 0)).await.unwrap();

        let filter = AuditFilter::new(Some("ALI"), None, None);
        let results = sink.search(&filter, 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].username, "alice");
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let sink = MemorySearchSink::new();
        sink.fail_next_writes(2);

        assert!(sink.upsert("a", &doc("a", "alice", 0)).await.is_err());
        assert!(sink.upsert("a", &doc("a", "alice", 0)).await.is_err());
        assert!(sink.upsert("a", &doc("a", "alice", 0)).await.is_ok());
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_outage() {
        let sink = MemorySearchSink::new();
        sink.set_available(false);

        assert!(matches!(
            sink.upsert("a", &doc("a", "alice", 0)).await,
            Err(IndexError::Unavailable(_))
        ));
        assert!(sink.search(&AuditFilter::default(), 10).await.is_err());
        assert!(sink.ensure_index().await.is_err());

        sink.set_available(true);
        sink.ensure_index().await.unwrap();
        assert!(sink.index_created());
    }
}
