//! Scan and compaction benchmark.
//!
//! Measures filtered in-memory scans over a tree of many small parts versus
//! one compacted part, plus the cost of compacting and persisting.
//!
//! Run: cargo bench --bench scan_bench

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use eventdb::{
    BatchBuilder, CancelToken, Engine, EngineConfig, Filter, Filters, MemoryStore, RangeOp,
    SchemaDescriptor, Value,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const PAGES: [&str; 8] = [
    "/", "/pricing", "/docs", "/docs/api", "/blog", "/blog/post", "/signup", "/login",
];

fn make_batch(schema: &SchemaDescriptor, offset: usize, rows: usize) -> arrow_array::RecordBatch {
    let page = schema.index_of("page").unwrap();
    let duration = schema.index_of("duration").unwrap();
    let mut b = BatchBuilder::new(schema);
    for i in offset..offset + rows {
        let mut row = vec![Value::Null; schema.fields().len()];
        row[0] = Value::Int(i as i64 * 10);
        row[1] = Value::Int(i as i64);
        row[page] = PAGES[i % PAGES.len()].into();
        row[duration] = Value::Int((i % 900) as i64);
        b.append_row(row).unwrap();
    }
    b.finish().unwrap()
}

/// Engine holding `total_rows` rows of one resource split over `parts` parts.
fn create_engine(total_rows: usize, parts: usize, persist_bytes: usize) -> Engine {
    let mut config = EngineConfig::default();
    config.compaction.persist_bytes = persist_bytes;
    config.storage.backoff_ms = 0;
    let engine =
        Engine::open(SchemaDescriptor::events(), config, Arc::new(MemoryStore::new())).unwrap();
    let schema = engine.schema().clone();

    let per_part = total_rows / parts;
    for p in 0..parts {
        let offset = p * per_part;
        let rows = if p == parts - 1 { total_rows - offset } else { per_part };
        engine.add("site", make_batch(&schema, offset, rows)).unwrap();
    }
    engine
}

// ---------------------------------------------------------------------------
// Benchmarks: scan
// ---------------------------------------------------------------------------

fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan");
    let eq = Filters::compile(vec![Filter::eq("page", "/docs")]).unwrap();
    let re = Filters::compile(vec![Filter::re_eq("page", "^/blog")]).unwrap();
    let range = Filters::compile(vec![Filter::range("duration", RangeOp::Between(100, 200))]).unwrap();

    for parts in [1, 16, 64] {
        let engine = create_engine(64_000, parts, usize::MAX);
        for (name, filters) in [("eq", &eq), ("regex", &re), ("range", &range)] {
            group.bench_with_input(BenchmarkId::new(name, parts), &parts, |b, _| {
                b.iter(|| {
                    black_box(
                        engine
                            .scan("site", 100_000, 500_000, filters, &["timestamp".to_string()])
                            .unwrap(),
                    )
                });
            });
        }
    }

    group.finish();
}

fn bench_aggregate(c: &mut Criterion) {
    let engine = create_engine(64_000, 16, usize::MAX);
    let filters = Filters::compile(vec![Filter::eq("page", "/pricing")]).unwrap();
    c.bench_function("aggregate_duration_16_parts", |b| {
        b.iter(|| black_box(engine.aggregate("site", 0, i64::MAX, &filters, "duration").unwrap()));
    });
}

// ---------------------------------------------------------------------------
// Benchmarks: compaction
// ---------------------------------------------------------------------------

fn bench_compact(c: &mut Criterion) {
    let mut group = c.benchmark_group("compact");

    for parts in [4, 16] {
        group.bench_with_input(BenchmarkId::new("in_memory", parts), &parts, |b, &parts| {
            b.iter_batched(
                || create_engine(20_000, parts, usize::MAX),
                |engine| black_box(engine.compact("site").unwrap()),
                BatchSize::LargeInput,
            );
        });
        group.bench_with_input(BenchmarkId::new("persist", parts), &parts, |b, &parts| {
            b.iter_batched(
                || create_engine(20_000, parts, 0),
                |engine| black_box(engine.compact("site").unwrap()),
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

fn bench_query_granules(c: &mut Criterion) {
    let engine = create_engine(20_000, 4, 0);
    engine.compact("site").unwrap();
    let filters = Filters::compile(vec![Filter::eq("page", "/docs")]).unwrap();
    c.bench_function("query_one_granule", |b| {
        b.iter(|| {
            black_box(
                engine
                    .query("site", 0, i64::MAX, &filters, &[], &CancelToken::new())
                    .unwrap(),
            )
        });
    });
}

criterion_group!(benches, bench_scan, bench_aggregate, bench_compact, bench_query_granules);
criterion_main!(benches);
