//! Core audit types for the a3s-audit pipeline
//!
//! All types use camelCase JSON serialization for wire compatibility.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Username recorded when no authenticated principal is known
pub const ANONYMOUS: &str = "anonymous";

/// Placeholder trace ids some upstream layers emit when none was assigned
const UNASSIGNED_TRACE_IDS: &[&str] = &["N/A", "-"];

/// One audited operation
///
/// Created by the caller when an audited operation completes, persisted to
/// the relational store, then published exactly once. Redeliveries carry the
/// same record; the attempt count lives in message metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// Relational store id, assigned on insert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    /// Per-request correlation id
    #[serde(default)]
    pub trace_id: String,

    /// Acting principal, or "anonymous"
    pub username: String,

    /// Human-readable operation label
    pub operation: String,

    /// Longer description of the operation
    #[serde(default)]
    pub description: String,

    /// Type that owns the audited call site
    pub class_name: String,

    /// Audited method or handler name
    pub method_name: String,

    /// Serialized call arguments
    #[serde(default)]
    pub args: String,

    /// Wall-clock duration of the audited call in milliseconds
    pub elapsed_time: u64,

    /// When the record was created (never mutated)
    pub create_time: DateTime<Utc>,

    /// Request path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,

    /// Request method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_method: Option<String>,

    /// Client address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl AuditRecord {
    /// Create a record stamped with the current time and an empty trace id
    pub fn new(
        username: impl Into<String>,
        operation: impl Into<String>,
        class_name: impl Into<String>,
        method_name: impl Into<String>,
    ) -> Self {
        let operation = operation.into();
        let username = username.into();
        Self {
            id: None,
            trace_id: String::new(),
            username: if username.trim().is_empty() {
                ANONYMOUS.to_string()
            } else {
                username
            },
            description: operation.clone(),
            operation,
            class_name: class_name.into(),
            method_name: method_name.into(),
            args: String::new(),
            elapsed_time: 0,
            create_time: Utc::now(),
            uri: None,
            http_method: None,
            ip: None,
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.args = args.into();
        self
    }

    pub fn with_elapsed_ms(mut self, elapsed_time: u64) -> Self {
        self.elapsed_time = elapsed_time;
        self
    }

    pub fn with_create_time(mut self, create_time: DateTime<Utc>) -> Self {
        self.create_time = create_time;
        self
    }

    /// Attach request context (path, method, client address)
    pub fn with_request(
        mut self,
        uri: impl Into<String>,
        http_method: impl Into<String>,
        ip: impl Into<String>,
    ) -> Self {
        self.uri = Some(uri.into());
        self.http_method = Some(http_method.into());
        self.ip = Some(ip.into());
        self
    }

    /// Whether the trace id is missing or a known placeholder
    pub fn has_trace_id(&self) -> bool {
        let trace_id = self.trace_id.trim();
        !trace_id.is_empty() && !UNASSIGNED_TRACE_IDS.contains(&trace_id)
    }

    /// Assign a fresh trace id if none is set, returning the effective id
    pub fn ensure_trace_id(&mut self) -> &str {
        if !self.has_trace_id() {
            self.trace_id = new_trace_id();
        }
        &self.trace_id
    }

    /// Deterministic search document id: store id if assigned, else trace id
    pub fn document_id(&self) -> String {
        match self.id {
            Some(id) => id.to_string(),
            None => self.trace_id.clone(),
        }
    }
}

/// Generate a new trace id
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// An audit record plus its retry bookkeeping
///
/// The attempt count is never written into the record. Each redelivery
/// rebuilds the envelope with the next count.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryEnvelope {
    pub record: AuditRecord,
    pub attempt_count: u32,
}

impl RetryEnvelope {
    /// First delivery of a record
    pub fn new(record: AuditRecord) -> Self {
        Self {
            record,
            attempt_count: 0,
        }
    }

    /// Envelope for the next delivery after a failed attempt
    pub fn retried(&self) -> Self {
        Self {
            record: self.record.clone(),
            attempt_count: self.attempt_count.saturating_add(1),
        }
    }
}

/// Query filter shared by the search sink and the relational store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditFilter {
    /// Case-insensitive match against username or operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,

    /// Inclusive lower bound on createTime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// Inclusive upper bound on createTime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl AuditFilter {
    /// Build a filter, treating a blank keyword as absent
    pub fn new(
        keyword: Option<&str>,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Self {
        let keyword = keyword
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);
        Self {
            keyword,
            start_time,
            end_time,
        }
    }

    /// No keyword and no time bounds
    pub fn is_empty(&self) -> bool {
        self.keyword.is_none() && self.start_time.is_none() && self.end_time.is_none()
    }

    /// In-process evaluation, used by the memory backends
    pub fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(ref keyword) = self.keyword {
            let keyword = keyword.to_lowercase();
            if !record.username.to_lowercase().contains(&keyword)
                && !record.operation.to_lowercase().contains(&keyword)
            {
                return false;
            }
        }
        if let Some(start) = self.start_time {
            if record.create_time < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if record.create_time > end {
                return false;
            }
        }
        true
    }
}

/// Largest page size served by listing endpoints
pub const MAX_PAGE_SIZE: u32 = 1000;

/// 0-based page request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
}

impl PageRequest {
    /// Create a page request, clamping size to 1..=MAX_PAGE_SIZE
    pub fn new(page: u32, size: u32) -> Self {
        Self {
            page,
            size: size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        self.page as u64 * self.size as u64
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 0, size: 10 }
    }
}

/// One page of results with pagination metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub size: u32,
    pub total: u64,
}

impl<T> Page<T> {
    pub fn empty(request: PageRequest) -> Self {
        Self {
            items: Vec::new(),
            page: request.page,
            size: request.size,
            total: 0,
        }
    }

    /// Number of pages needed to hold `total` items
    pub fn total_pages(&self) -> u64 {
        if self.size == 0 {
            return 0;
        }
        self.total.div_ceil(self.size as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> AuditRecord {
        AuditRecord::new("alice", "login", "AuthService", "login")
            .with_trace_id("t1")
            .with_args("[alice]")
            .with_elapsed_ms(12)
            .with_request("/api/login", "POST", "10.0.0.1")
    }

    #[test]
    fn test_record_defaults() {
        let record = AuditRecord::new("", "delete user", "UserService", "delete");
        assert_eq!(record.username, ANONYMOUS);
        assert_eq!(record.description, "delete user");
        assert!(record.id.is_none());
        assert!(!record.has_trace_id());
    }

    #[test]
    fn test_ensure_trace_id_generates_once() {
        let mut record = AuditRecord::new("bob", "op", "C", "m");
        let first = record.ensure_trace_id().to_string();
        assert!(!first.is_empty());
        let second = record.ensure_trace_id().to_string();
        assert_eq!(first, second);
    }

    #[test]
    fn test_ensure_trace_id_replaces_placeholder() {
        let mut record = AuditRecord::new("bob", "op", "C", "m").with_trace_id("N/A");
        assert!(!record.has_trace_id());
        record.ensure_trace_id();
        assert_ne!(record.trace_id, "N/A");
    }

    #[test]
    fn test_ensure_trace_id_keeps_existing() {
        let mut record = sample();
        assert_eq!(record.ensure_trace_id(), "t1");
    }

    #[test]
    fn test_document_id_prefers_store_id() {
        let mut record = sample();
        assert_eq!(record.document_id(), "t1");
        record.id = Some(42);
        assert_eq!(record.document_id(), "42");
    }

    #[test]
    fn test_record_wire_format() {
        let record = sample();
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"traceId\":\"t1\""));
        assert!(json.contains("\"className\":\"AuthService\""));
        assert!(json.contains("\"elapsedTime\":12"));
        assert!(json.contains("\"httpMethod\":\"POST\""));
        assert!(json.contains("\"createTime\""));
        // Unassigned id is omitted from the wire body
        assert!(!json.contains("\"id\""));

        let parsed: AuditRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_record_rejects_negative_elapsed() {
        let json = r#"{
            "traceId": "t9",
            "username": "alice",
            "operation": "login",
            "className": "C",
            "methodName": "m",
            "elapsedTime": -5,
            "createTime": "2024-01-01T00:00:00Z"
        }"#;
        assert!(serde_json::from_str::<AuditRecord>(json).is_err());
    }

    #[test]
    fn test_retry_envelope_rebuilds() {
        let envelope = RetryEnvelope::new(sample());
        assert_eq!(envelope.attempt_count, 0);

        let retried = envelope.retried().retried();
        assert_eq!(retried.attempt_count, 2);
        assert_eq!(retried.record, envelope.record);
        assert_eq!(envelope.attempt_count, 0);
    }

    #[test]
    fn test_filter_blank_keyword_is_empty() {
        assert!(AuditFilter::new(Some("   "), None, None).is_empty());
        assert!(AuditFilter::new(None, None, None).is_empty());
        assert!(!AuditFilter::new(Some("alice"), None, None).is_empty());
    }

    #[test]
    fn test_filter_matches_keyword_case_insensitive() {
        let record = sample();
        assert!(AuditFilter::new(Some("ALI"), None, None).matches(&record));
        assert!(AuditFilter::new(Some("Log"), None, None).matches(&record));
        assert!(!AuditFilter::new(Some("carol"), None, None).matches(&record));
    }

    #[test]
    fn test_filter_time_bounds_inclusive() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let record = sample().with_create_time(at);

        assert!(AuditFilter::new(None, Some(at), Some(at)).matches(&record));
        let later = at + chrono::Duration::milliseconds(1);
        assert!(!AuditFilter::new(None, Some(later), None).matches(&record));
        let earlier = at - chrono::Duration::milliseconds(1);
        assert!(!AuditFilter::new(None, None, Some(earlier)).matches(&record));
    }

    #[test]
    fn test_page_request_clamps_size() {
        assert_eq!(PageRequest::new(0, 0).size, 1);
        assert_eq!(PageRequest::new(0, 5000).size, MAX_PAGE_SIZE);
        assert_eq!(PageRequest::new(3, 20).offset(), 60);
    }

    #[test]
    fn test_page_total_pages() {
        let mut page: Page<AuditRecord> = Page::empty(PageRequest::new(0, 10));
        assert_eq!(page.total_pages(), 0);
        page.total = 21;
        assert_eq!(page.total_pages(), 3);
    }
}
