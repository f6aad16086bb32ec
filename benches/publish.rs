//! Performance benchmarks for a3s-audit
//!
//! Run with: cargo bench

use a3s_audit::provider::memory::MemoryBroker;
use a3s_audit::provider::OutboundMessage;
use a3s_audit::sink::{AuditDocument, MemorySearchSink};
use a3s_audit::store::MemoryAuditStore;
use a3s_audit::{
    AuditFilter, AuditQueryService, AuditRecord, BrokerProvider, Indexer, RetryEnvelope,
    Topology,
};
use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;

fn sample_record(i: usize) -> AuditRecord {
    AuditRecord::new("alice", "export report", "ReportService", "export")
        .with_trace_id(format!("trace-{}", i))
        .with_args(r#"[{"format":"csv","rows":1000}]"#)
        .with_elapsed_ms(42)
        .with_request("/api/reports/export", "POST", "10.0.0.1")
}

fn bench_record_serialization(c: &mut Criterion) {
    let record = sample_record(0);

    c.bench_function("AuditRecord serialize", |b| {
        b.iter(|| serde_json::to_vec(&record).unwrap());
    });

    let bytes = serde_json::to_vec(&record).unwrap();
    c.bench_function("AuditRecord deserialize", |b| {
        b.iter(|| serde_json::from_slice::<AuditRecord>(&bytes).unwrap());
    });

    c.bench_function("AuditDocument::from_record", |b| {
        b.iter(|| AuditDocument::from_record(&record));
    });
}

fn bench_memory_publish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let topology = Topology::default();
    let broker = MemoryBroker::new();
    rt.block_on(broker.declare(&topology)).unwrap();

    c.bench_function("MemoryBroker publish + confirm", |b| {
        b.to_async(&rt).iter(|| async {
            let envelope = RetryEnvelope::new(sample_record(0));
            let message = OutboundMessage::for_envelope(&topology, &envelope).unwrap();
            broker.publish(message).await.unwrap().await
        });
    });
}

fn bench_index_and_search(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let sink = MemorySearchSink::new();
    let indexer = Indexer::new(Arc::new(sink.clone()));

    rt.block_on(async {
        for i in 0..1000 {
            indexer.index(&sample_record(i)).await.unwrap();
        }
    });

    c.bench_function("Indexer index (overwrite)", |b| {
        b.to_async(&rt)
            .iter(|| async { indexer.index(&sample_record(7)).await.unwrap() });
    });

    let query = AuditQueryService::new(Arc::new(sink), Arc::new(MemoryAuditStore::new()));
    let filter = AuditFilter::new(Some("alice"), None, None);
    c.bench_function("search (memory sink, limit 100)", |b| {
        b.to_async(&rt)
            .iter(|| async { query.search_with_source(&filter).await });
    });
}

criterion_group!(
    benches,
    bench_record_serialization,
    bench_memory_publish,
    bench_index_and_search,
);
criterion_main!(benches);
