//! Audit capture around an operation
//!
//! `AuditRecorder::record` wraps an audited future: it times the call,
//! persists the resulting record, emits it for indexing, and hands back
//! the call's own result untouched.

use crate::publisher::AuditPublisher;
use crate::store::AuditStore;
use crate::types::{new_trace_id, AuditRecord, ANONYMOUS};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

/// Suffix appended to operation and description when the call fails
pub const FAILED_SUFFIX: &str = " (failed)";

/// Per-request context, passed explicitly and dropped with the request
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub trace_id: String,
    pub username: Option<String>,
    pub uri: Option<String>,
    pub http_method: Option<String>,
    pub ip: Option<String>,
}

impl RequestContext {
    /// Context with a freshly generated trace id
    pub fn new() -> Self {
        Self {
            trace_id: new_trace_id(),
            ..Default::default()
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

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
}

/// Static description of an audited call site
#[derive(Debug, Clone)]
pub struct CallSite {
    pub class_name: String,
    pub method_name: String,
    pub operation: String,
    pub description: Option<String>,
    pub args: String,
}

impl CallSite {
    pub fn new(
        class_name: impl Into<String>,
        method_name: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            operation: operation.into(),
            description: None,
            args: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Arguments serialized as JSON; unserializable arguments are recorded empty
    pub fn with_args<A: serde::Serialize>(mut self, args: &A) -> Self {
        self.args = serde_json::to_string(args).unwrap_or_default();
        self
    }
}

/// Persists and emits one audit record per wrapped call
#[derive(Clone)]
pub struct AuditRecorder {
    store: Arc<dyn AuditStore>,
    publisher: Arc<AuditPublisher>,
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn AuditStore>, publisher: Arc<AuditPublisher>) -> Self {
        Self { store, publisher }
    }

    /// Run `call`, then audit it; the call's result is returned unchanged
    pub async fn record<F, T, E>(&self, ctx: &RequestContext, site: CallSite, call: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let span = tracing::info_span!(
            "audited",
            trace_id = %ctx.trace_id,
            operation = %site.operation
        );

        let started = Instant::now();
        let result = call.instrument(span.clone()).await;
        let elapsed = started.elapsed().as_millis() as u64;

        let record = build_record(ctx, site, elapsed, result.is_ok());
        self.persist_and_emit(record).instrument(span).await;

        result
    }

    async fn persist_and_emit(&self, mut record: AuditRecord) {
        record.ensure_trace_id();

        match self.store.insert(&record).await {
            Ok(id) => record.id = Some(id),
            Err(e) => {
                tracing::error!(
                    trace_id = %record.trace_id,
                    store = self.store.name(),
                    error = %e,
                    "Failed to persist audit record"
                );
            }
        }

        self.publisher.emit(record);
    }
}

fn build_record(ctx: &RequestContext, site: CallSite, elapsed: u64, succeeded: bool) -> AuditRecord {
    let username = ctx
        .username
        .clone()
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| ANONYMOUS.to_string());
    let mut operation = site.operation;
    let mut description = site.description.unwrap_or_else(|| operation.clone());
    if !succeeded {
        operation.push_str(FAILED_SUFFIX);
        description.push_str(FAILED_SUFFIX);
    }

    let mut record = AuditRecord::new(username, operation, site.class_name, site.method_name)
        .with_trace_id(ctx.trace_id.clone())
        .with_description(description)
        .with_args(site.args)
        .with_elapsed_ms(elapsed);
    record.uri = ctx.uri.clone();
    record.http_method = ctx.http_method.clone();
    record.ip = ctx.ip.clone();
    record
}
