//! Search sinks: the indexed, query-optimized copy of audit records
//!
//! `SearchSink` is implemented by `ElasticsearchSink` (REST) and
//! `MemorySearchSink` (in-process, for tests and local runs).

use crate::error::{AuditError, IndexError, Result};
use crate::types::{AuditFilter, AuditRecord};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub mod elastic;
pub mod memory;

pub use elastic::{ElasticsearchConfig, ElasticsearchSink};
pub use memory::MemorySearchSink;

/// Core trait for search sinks
#[async_trait]
pub trait SearchSink: Send + Sync {
    /// Create the target index if it does not exist
    async fn ensure_index(&self) -> Result<()>;

    /// Write a document under `doc_id`, replacing any previous version
    async fn upsert(&self, doc_id: &str, document: &AuditDocument)
        -> std::result::Result<(), IndexError>;

    /// Documents matching `filter`, newest first, at most `limit`
    async fn search(&self, filter: &AuditFilter, limit: usize) -> Result<Vec<AuditRecord>>;

    /// Sink name (e.g., "elasticsearch", "memory")
    fn name(&self) -> &str;
}

/// Search-index representation of an audit record
///
/// Identical to the wire record except `createTime`, which is stored as
/// epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default)]
    pub trace_id: String,
    pub username: String,
    pub operation: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub class_name: String,
    #[serde(default)]
    pub method_name: String,
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub elapsed_time: u64,

    /// Epoch milliseconds; RFC 3339 strings are accepted on read
    #[serde(deserialize_with = "epoch_millis_or_rfc3339")]
    pub create_time: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl AuditDocument {
    pub fn from_record(record: &AuditRecord) -> Self {
        Self {
            id: record.id,
            trace_id: record.trace_id.clone(),
            username: record.username.clone(),
            operation: record.operation.clone(),
            description: record.description.clone(),
            class_name: record.class_name.clone(),
            method_name: record.method_name.clone(),
            args: record.args.clone(),
            elapsed_time: record.elapsed_time,
            create_time: record.create_time.timestamp_millis(),
            uri: record.uri.clone(),
            http_method: record.http_method.clone(),
            ip: record.ip.clone(),
        }
    }

    /// Convert back to a record; an out-of-range timestamp is an error
    pub fn into_record(self) -> Result<AuditRecord> {
        let create_time = millis_to_datetime(self.create_time)?;
        Ok(AuditRecord {
            id: self.id,
            trace_id: self.trace_id,
            username: self.username,
            operation: self.operation,
            description: self.description,
            class_name: self.class_name,
            method_name: self.method_name,
            args: self.args,
            elapsed_time: self.elapsed_time,
            create_time,
            uri: self.uri,
            http_method: self.http_method,
            ip: self.ip,
        })
    }
}

pub(crate) fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| AuditError::Search(format!("createTime out of range: {}", millis)))
}

fn epoch_millis_or_rfc3339<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Millis(millis) => Ok(millis),
        Raw::Text(text) => match text.parse::<i64>() {
            Ok(millis) => Ok(millis),
            Err(_) => DateTime::parse_from_rfc3339(&text)
                .map(|dt| dt.timestamp_millis())
                .map_err(serde::de::Error::custom),
        },
    }
}
