//! Relational store: the system of record for audit records
//!
//! `AuditStore` is implemented by `SqliteAuditStore` (sqlx) and
//! `MemoryAuditStore`. Both order results newest first.

use crate::error::Result;
use crate::types::{AuditFilter, AuditRecord, Page, PageRequest};
use async_trait::async_trait;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryAuditStore;
pub use sqlite::{DatabaseConfig, SqliteAuditStore};

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persist a record, returning its assigned id
    async fn insert(&self, record: &AuditRecord) -> Result<i64>;

    /// Records matching `filter`, newest first, at most `limit`
    async fn search(&self, filter: &AuditFilter, limit: usize) -> Result<Vec<AuditRecord>>;

    /// The `limit` most recent records
    async fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        self.search(&AuditFilter::default(), limit).await
    }

    /// One page of matching records, newest first, with the total count
    async fn page(&self, filter: &AuditFilter, request: PageRequest) -> Result<Page<AuditRecord>>;

    /// Store name (e.g., "sqlite", "memory")
    fn name(&self) -> &str;
}
