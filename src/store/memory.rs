//! In-memory audit store for testing and local runs

use super::AuditStore;
use crate::error::{AuditError, Result};
use crate::types::{AuditFilter, AuditRecord, Page, PageRequest};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct StoreState {
    records: Vec<AuditRecord>,
    next_id: i64,
}

/// In-memory audit store
///
/// Cloning shares the same records.
#[derive(Clone, Default)]
pub struct MemoryAuditStore {
    state: Arc<Mutex<StoreState>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a database outage
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AuditError::Connection("memory store is down".to_string()));
        }
        Ok(())
    }

    /// Matching records, newest first
    fn matching(&self, filter: &AuditFilter) -> Vec<AuditRecord> {
        let mut records: Vec<AuditRecord> = self
            .lock()
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.create_time
                .cmp(&a.create_time)
                .then_with(|| b.id.cmp(&a.id))
        });
        records
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn insert(&self, record: &AuditRecord) -> Result<i64> {
        self.check_available()?;

        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;

        let mut stored = record.clone();
        stored.id = Some(id);
        state.records.push(stored);
        Ok(id)
    }

    async fn search(&self, filter: &AuditFilter, limit: usize) -> Result<Vec<AuditRecord>> {
        self.check_available()?;
        let mut records = self.matching(filter);
        records.truncate(limit);
        Ok(records)
    }

    async fn page(&self, filter: &AuditFilter, request: PageRequest) -> Result<Page<AuditRecord>> {
        self.check_available()?;
        let records = self.matching(filter);
        let total = records.len() as u64;
        let items = records
            .into_iter()
            .skip(usize::try_from(request.offset()).unwrap_or(usize::MAX))
            .take(request.size as usize)
            .collect();

        Ok(Page {
            items,
            page: request.page,
            size: request.size,
            total,
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}
