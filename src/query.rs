//! Query service: search sink first, relational store as fallback

use crate::sink::SearchSink;
use crate::store::AuditStore;
use crate::types::{AuditFilter, AuditRecord, Page, PageRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Query settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Result bound for both the search path and the fallback
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Bound on each search-sink and relational-store query
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_max_results() -> usize {
    100
}

fn default_timeout_ms() -> u64 {
    3000
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Which sink answered a search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuerySource {
    Search,
    Fallback,
}

impl std::fmt::Display for QuerySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuerySource::Search => write!(f, "search"),
            QuerySource::Fallback => write!(f, "fallback"),
        }
    }
}

/// Search results tagged with their source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchOutcome {
    pub records: Vec<AuditRecord>,
    pub source: QuerySource,
}

/// Read path over both sinks
///
/// Never returns an error: a failing sink yields the other sink's data or
/// an empty result.
#[derive(Clone)]
pub struct AuditQueryService {
    search: Arc<dyn SearchSink>,
    store: Arc<dyn AuditStore>,
    config: QueryConfig,
}

impl AuditQueryService {
    pub fn new(search: Arc<dyn SearchSink>, store: Arc<dyn AuditStore>) -> Self {
        Self {
            search,
            store,
            config: QueryConfig::default(),
        }
    }

    pub fn with_config(mut self, config: QueryConfig) -> Self {
        self.config = config;
        self
    }

    /// Records matching `keyword` (username or operation) within the
    /// inclusive time range, newest first
    pub async fn search(
        &self,
        keyword: Option<&str>,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Vec<AuditRecord> {
        self.search_with_source(&AuditFilter::new(keyword, start_time, end_time))
            .await
            .records
    }

    pub async fn search_with_source(&self, filter: &AuditFilter) -> SearchOutcome {
        let limit = self.config.max_results;
        let timeout = Duration::from_millis(self.config.timeout_ms);

        let reason = match tokio::time::timeout(timeout, self.search.search(filter, limit)).await {
            Ok(Ok(records)) if !records.is_empty() => {
                tracing::debug!(
                    source = %QuerySource::Search,
                    hits = records.len(),
                    "Audit search served by search sink"
                );
                return SearchOutcome {
                    records,
                    source: QuerySource::Search,
                };
            }
            Ok(Ok(_)) => "empty",
            Ok(Err(e)) => {
                tracing::warn!(sink = self.search.name(), error = %e, "Search sink query failed");
                "unavailable"
            }
            Err(_) => {
                tracing::warn!(
                    sink = self.search.name(),
                    timeout_ms = self.config.timeout_ms,
                    "Search sink query timed out"
                );
                "unavailable"
            }
        };

        let fallback = if filter.is_empty() {
            tokio::time::timeout(timeout, self.store.recent(limit)).await
        } else {
            tokio::time::timeout(timeout, self.store.search(filter, limit)).await
        };

        let records = match fallback {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => {
                tracing::error!(store = self.store.name(), error = %e, "Fallback query failed");
                Vec::new()
            }
            Err(_) => {
                tracing::error!(
                    store = self.store.name(),
                    timeout_ms = self.config.timeout_ms,
                    "Fallback query timed out"
                );
                Vec::new()
            }
        };

        tracing::info!(
            source = %QuerySource::Fallback,
            reason = reason,
            recent_only = filter.is_empty(),
            hits = records.len(),
            "Audit search served by relational store"
        );

        SearchOutcome {
            records,
            source: QuerySource::Fallback,
        }
    }

    /// One page from the relational store, newest first
    pub async fn page(&self, filter: &AuditFilter, request: PageRequest) -> Page<AuditRecord> {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        match tokio::time::timeout(timeout, self.store.page(filter, request)).await {
            Ok(Ok(page)) => page,
            Ok(Err(e)) => {
                tracing::error!(store = self.store.name(), error = %e, "Paged audit query failed");
                Page::empty(request)
            }
            Err(_) => {
                tracing::error!(
                    store = self.store.name(),
                    timeout_ms = self.config.timeout_ms,
                    "Paged audit query timed out"
                );
                Page::empty(request)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::indexer::Indexer;
    use crate::sink::MemorySearchSink;
    use crate::store::MemoryAuditStore;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::time::Instant;

    /// Store whose queries never complete
    struct HungStore;

    #[async_trait]
    impl AuditStore for HungStore {
        async fn insert(&self, _record: &AuditRecord) -> Result<i64> {
            futures::future::pending().await
        }

        async fn search(&self, _filter: &AuditFilter, _limit: usize) -> Result<Vec<AuditRecord>> {
            futures::future::pending().await
        }

        async fn page(
            &self,
            _filter: &AuditFilter,
            _request: PageRequest,
        ) -> Result<Page<AuditRecord>> {
            futures::future::pending().await
        }

        fn name(&self) -> &str {
            "hung"
        }
    }

    fn short_timeout() -> QueryConfig {
        QueryConfig {
            timeout_ms: 100,
            ..Default::default()
        }
    }

    struct Fixture {
        sink: MemorySearchSink,
        store: MemoryAuditStore,
        service: AuditQueryService,
    }

    fn fixture() -> Fixture {
        let sink = MemorySearchSink::new();
        let store = MemoryAuditStore::new();
        let service = AuditQueryService::new(Arc::new(sink.clone()), Arc::new(store.clone()));
        Fixture {
            sink,
            store,
            service,
        }
    }

    fn record(username: &str, operation: &str, trace_id: &str) -> AuditRecord {
        AuditRecord::new(username, operation, "Svc", "call").with_trace_id(trace_id)
    }

    #[tokio::test]
    async fn test_search_sink_hit() {
        let f = fixture();
        Indexer::new(Arc::new(f.sink.clone()))
            .index(&record("alice", "login", "t1"))
            .await
            .unwrap();
        f.store.insert(&record("alice", "login", "t0")).await.unwrap();

        let outcome = f
            .service
            .search_with_source(&AuditFilter::new(Some("alice"), None, None))
            .await;
        assert_eq!(outcome.source, QuerySource::Search);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].trace_id, "t1");
    }

    #[tokio::test]
    async fn test_empty_search_falls_back() {
        let f = fixture();
        f.store.insert(&record("alice", "login", "t1")).await.unwrap();
        f.store.insert(&record("bob", "login", "t2")).await.unwrap();

        let outcome = f
            .service
            .search_with_source(&AuditFilter::new(Some("alice"), None, None))
            .await;
        assert_eq!(outcome.source, QuerySource::Fallback);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].username, "alice");
    }

    #[tokio::test]
    async fn test_unavailable_search_falls_back() {
        let f = fixture();
        f.sink.set_available(false);
        f.store.insert(&record("alice", "login", "t1")).await.unwrap();

        let records = f.service.search(Some("login"), None, None).await;
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_filters_fall_back_to_recent() {
        let f = fixture();
        let service = f.service.clone().with_config(QueryConfig {
            max_results: 3,
            ..Default::default()
        });
        for i in 0..5 {
            let record = record("u", "op", &format!("t{}", i))
                .with_create_time(Utc::now() - ChronoDuration::minutes(10 - i));
            f.store.insert(&record).await.unwrap();
        }

        let records = service.search(Some("  "), None, None).await;
        let ids: Vec<_> = records.iter().map(|r| r.trace_id.as_str()).collect();
        assert_eq!(ids, vec!["t4", "t3", "t2"]);
    }

    #[tokio::test]
    async fn test_both_sinks_down_returns_empty() {
        let f = fixture();
        f.sink.set_available(false);
        f.store.set_available(false);

        let outcome = f.service.search_with_source(&AuditFilter::default()).await;
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.source, QuerySource::Fallback);
    }

    #[tokio::test]
    async fn test_page_error_returns_empty_page() {
        let f = fixture();
        f.store.set_available(false);
        let page = f
            .service
            .page(&AuditFilter::default(), PageRequest::new(3, 20))
            .await;
        assert!(page.items.is_empty());
        assert_eq!(page.page, 3);
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn test_slow_search_sink_falls_back() {
        let f = fixture();
        let service = f.service.clone().with_config(short_timeout());
        Indexer::new(Arc::new(f.sink.clone()))
            .index(&record("alice", "login", "t1"))
            .await
            .unwrap();
        f.store.insert(&record("alice", "login", "t0")).await.unwrap();
        f.sink.set_search_latency(Some(Duration::from_secs(10)));

        let started = Instant::now();
        let outcome = service
            .search_with_source(&AuditFilter::new(Some("alice"), None, None))
            .await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(outcome.source, QuerySource::Fallback);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].trace_id, "t0");
    }

    #[tokio::test]
    async fn test_hung_store_search_returns_empty() {
        let sink = MemorySearchSink::new();
        sink.set_available(false);
        let service =
            AuditQueryService::new(Arc::new(sink), Arc::new(HungStore)).with_config(short_timeout());

        let started = Instant::now();
        let outcome = service
            .search_with_source(&AuditFilter::new(Some("alice"), None, None))
            .await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.source, QuerySource::Fallback);

        let recent = service.search(None, None, None).await;
        assert!(recent.is_empty());
    }

    #[tokio::test]
    async fn test_hung_store_page_returns_empty_page() {
        let service = AuditQueryService::new(Arc::new(MemorySearchSink::new()), Arc::new(HungStore))
            .with_config(short_timeout());

        let started = Instant::now();
        let page = service
            .page(&AuditFilter::default(), PageRequest::new(2, 10))
            .await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(page.items.is_empty());
        assert_eq!(page.page, 2);
        assert_eq!(page.total, 0);
    }
}
