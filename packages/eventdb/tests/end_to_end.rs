//! Integration test: ingest, scan, compact and query through the public API.
//!
//! Covers the add/scan walkthrough on a small three-column schema, row
//! conservation across in-memory and persisting compaction, and reads that
//! span memory plus durable granules.

use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::types::Int64Type;
use arrow_array::{Array, RecordBatch};
use eventdb::{
    Aggregate, BatchBuilder, CancelToken, ColumnKind, EngineConfig, Engine, FieldDescriptor,
    Filter, Filters, MemoryStore, RangeOp, SchemaDescriptor, Value,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn schema() -> SchemaDescriptor {
    SchemaDescriptor::new(
        1,
        vec![
            FieldDescriptor::new("timestamp", ColumnKind::Timestamp, false),
            FieldDescriptor::new("domain", ColumnKind::Text, true),
            FieldDescriptor::new("view", ColumnKind::Boolean, true),
            FieldDescriptor::new("duration", ColumnKind::Int64, true),
        ],
    )
    .unwrap()
}

fn batch(schema: &SchemaDescriptor, rows: &[(i64, &str, bool)]) -> RecordBatch {
    let mut b = BatchBuilder::new(schema);
    for &(ts, domain, view) in rows {
        b.append_row(vec![
            Value::Int(ts),
            domain.into(),
            view.into(),
            Value::Int(ts / 100),
        ])
        .unwrap();
    }
    b.finish().unwrap()
}

/// `(ts, domain, view)` for every row, sorted so part order does not matter.
fn rows(batch: &RecordBatch) -> Vec<(i64, String, bool)> {
    let ts = batch.column(0).as_primitive::<Int64Type>();
    let domain = batch.column(1).as_dictionary::<arrow_array::types::Int32Type>();
    let values = domain.values().as_string::<i32>();
    let view = batch.column(2).as_boolean();

    let mut out: Vec<(i64, String, bool)> = (0..batch.num_rows())
        .map(|i| {
            let d = domain.keys().value(i) as usize;
            (ts.value(i), values.value(d).to_string(), view.value(i))
        })
        .collect();
    out.sort();
    out
}

fn engine(persist_bytes: usize) -> Engine {
    let mut config = EngineConfig::default();
    config.compaction.persist_bytes = persist_bytes;
    config.storage.backoff_ms = 0;
    Engine::open(schema(), config, Arc::new(MemoryStore::new())).unwrap()
}

fn seed(engine: &Engine) {
    let schema = engine.schema().clone();
    engine
        .add(
            "site",
            batch(&schema, &[(100, "a", true), (200, "a", false), (300, "b", true)]),
        )
        .unwrap();
    engine
        .add("site", batch(&schema, &[(150, "a", true), (400, "b", false)]))
        .unwrap();
}

// ---------------------------------------------------------------------------
// Tests: in-memory scan
// ---------------------------------------------------------------------------

#[test]
fn scan_range_and_domain_filter() {
    let engine = engine(usize::MAX);
    seed(&engine);

    let filters = Filters::compile(vec![Filter::eq("domain", "a")]).unwrap();
    let out = engine.scan("site", 0, 250, &filters, &[]).unwrap();
    assert_eq!(
        rows(&out),
        vec![
            (100, "a".to_string(), true),
            (150, "a".to_string(), true),
            (200, "a".to_string(), false),
        ]
    );
}

#[test]
fn scan_full_range_returns_every_row_once() {
    let engine = engine(usize::MAX);
    seed(&engine);
    let out = engine
        .scan("site", i64::MIN, i64::MAX, &Filters::none(), &[])
        .unwrap();
    assert_eq!(out.num_rows(), 5);
    assert_eq!(engine.stats("site").rows, 5);
}

#[test]
fn scan_with_regex_and_negation() {
    let engine = engine(usize::MAX);
    seed(&engine);

    let not_a = Filters::compile(vec![Filter::neq("domain", "a")]).unwrap();
    let out = engine.scan("site", 0, 1000, &not_a, &[]).unwrap();
    assert_eq!(rows(&out).iter().map(|r| r.0).collect::<Vec<_>>(), vec![300, 400]);

    let re = Filters::compile(vec![Filter::re_eq("domain", "^(a|b)$")]).unwrap();
    assert_eq!(engine.scan("site", 0, 1000, &re, &[]).unwrap().num_rows(), 5);

    let invalid = Filters::compile(vec![Filter::re_eq("domain", "(")]);
    assert_eq!(invalid.unwrap_err().code(), "INVALID_REGEX");
}

#[test]
fn scan_with_numeric_range() {
    let engine = engine(usize::MAX);
    seed(&engine);
    // duration = ts / 100
    let filters = Filters::compile(vec![Filter::range("duration", RangeOp::Ge(3))]).unwrap();
    let out = engine.scan("site", 0, 1000, &filters, &[]).unwrap();
    assert_eq!(rows(&out).iter().map(|r| r.0).collect::<Vec<_>>(), vec![300, 400]);
}

// ---------------------------------------------------------------------------
// Tests: compaction
// ---------------------------------------------------------------------------

#[test]
fn in_memory_compaction_conserves_rows() {
    let engine = engine(usize::MAX);
    seed(&engine);
    let before = engine
        .scan("site", 0, 1000, &Filters::none(), &[])
        .unwrap();

    let result = engine.compact("site").unwrap();
    assert_eq!(result.parts_merged, 2);
    assert_eq!(result.rows, 5);
    assert!(result.granule.is_none());
    assert_eq!(engine.stats("site").parts, 1);

    let after = engine.scan("site", 0, 1000, &Filters::none(), &[]).unwrap();
    assert_eq!(rows(&after), rows(&before));
}

#[test]
fn persisted_rows_move_from_scan_to_query() {
    let engine = engine(0);
    seed(&engine);
    let before = engine
        .scan("site", 0, 1000, &Filters::none(), &[])
        .unwrap();

    let result = engine.compact("site").unwrap();
    let granule = result.granule.expect("compaction should persist");
    assert_eq!((granule.min, granule.max, granule.rows), (100, 400, 5));
    assert_eq!(engine.find_granules("site", 0, 99), Vec::<String>::new());
    assert_eq!(engine.find_granules("site", 400, 500), vec![granule.id.clone()]);

    assert_eq!(engine.scan("site", 0, 1000, &Filters::none(), &[]).unwrap().num_rows(), 0);
    let after = engine
        .query("site", 0, 1000, &Filters::none(), &[], &CancelToken::new())
        .unwrap();
    assert_eq!(rows(&after), rows(&before));

    let filters = Filters::compile(vec![Filter::eq("domain", "a")]).unwrap();
    let out = engine
        .query("site", 0, 250, &filters, &[], &CancelToken::new())
        .unwrap();
    assert_eq!(rows(&out).iter().map(|r| r.0).collect::<Vec<_>>(), vec![100, 150, 200]);
}

#[test]
fn query_projection_over_memory_and_granules() {
    let engine = engine(0);
    seed(&engine);
    engine.compact("site").unwrap();
    let schema = engine.schema().clone();
    engine.add("site", batch(&schema, &[(500, "c", true)])).unwrap();

    let out = engine
        .query(
            "site",
            0,
            1000,
            &Filters::none(),
            &["view".to_string(), "timestamp".to_string()],
            &CancelToken::new(),
        )
        .unwrap();
    assert_eq!(out.num_columns(), 2);
    assert_eq!(out.schema().field(0).name(), "view");
    assert_eq!(out.num_rows(), 6);
    // Memory rows come first.
    assert_eq!(out.column(1).as_primitive::<Int64Type>().value(0), 500);
    assert_eq!(out.column(0).null_count(), 0);
}

#[test]
fn aggregate_spans_memory_and_granules() {
    let engine = engine(0);
    seed(&engine);
    engine.compact("site").unwrap();
    let schema = engine.schema().clone();
    engine.add("site", batch(&schema, &[(500, "a", true)])).unwrap();

    let all = engine
        .aggregate("site", 0, 1000, &Filters::none(), "duration")
        .unwrap();
    assert_eq!(all, Aggregate { sum: 1 + 2 + 3 + 1 + 4 + 5, count: 6 });

    let filters = Filters::compile(vec![Filter::eq("domain", "a")]).unwrap();
    let a = engine.aggregate("site", 0, 1000, &filters, "duration").unwrap();
    assert_eq!(a, Aggregate { sum: 1 + 2 + 1 + 5, count: 4 });
}

#[test]
fn resources_are_isolated() {
    let engine = engine(usize::MAX);
    let schema = engine.schema().clone();
    engine.add("a.com", batch(&schema, &[(1, "a", true)])).unwrap();
    engine.add("b.com", batch(&schema, &[(2, "b", true)])).unwrap();

    assert_eq!(engine.resources(), vec!["a.com", "b.com"]);
    let out = engine.scan("a.com", 0, 10, &Filters::none(), &[]).unwrap();
    assert_eq!(rows(&out), vec![(1, "a".to_string(), true)]);
}

#[test]
fn schema_mismatch_is_rejected() {
    let engine = engine(usize::MAX);
    let other = SchemaDescriptor::events();
    let mut b = BatchBuilder::new(&other);
    let mut row = vec![Value::Null; other.fields().len()];
    row[0] = Value::Int(1);
    row[1] = Value::Int(1);
    b.append_row(row).unwrap();

    let err = engine.add("site", b.finish().unwrap()).unwrap_err();
    assert_eq!(err.code(), "SCHEMA_MISMATCH");
    assert_eq!(engine.stats("site").rows, 0);
}
