//! Ingest profile: RSS and throughput at various event counts.
//!
//! For 10K, 100K and 1M events: ingests in batches of 10K, compacts in
//! memory, then flushes everything to an on-disk blob store. Prints one
//! table row per size to stdout.
//!
//! Run: cargo run --release --bin ingest_profile

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use arrow_array::RecordBatch;
use eventdb::{BatchBuilder, CancelToken, Engine, Filter, Filters, SchemaDescriptor, Value};
use sysinfo::{ProcessRefreshKind, RefreshKind, System};

const BATCH_ROWS: usize = 10_000;
const RESOURCE: &str = "example.com";

// ── Temp directory (avoids dev-dependency on tempfile) ───────────────────

static COUNTER: AtomicUsize = AtomicUsize::new(0);

struct TmpDir(PathBuf);

impl TmpDir {
    fn new() -> Result<Self> {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let pid = std::process::id();
        let path = std::env::temp_dir().join(format!("eventdb-ingest-{}-{}", pid, id));
        std::fs::create_dir_all(&path).context("failed to create temp dir")?;
        Ok(Self(path))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TmpDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

// ── Event generator ────────────────────────────────────────────────────

const PAGES: [&str; 5] = ["/", "/pricing", "/docs", "/blog", "/signup"];
const BROWSERS: [&str; 4] = ["Firefox", "Chrome", "Safari", "Edge"];

fn make_batch(schema: &SchemaDescriptor, offset: usize, rows: usize) -> Result<RecordBatch> {
    let page = schema.index_of("page").context("schema has no page column")?;
    let browser = schema.index_of("browser").context("schema has no browser column")?;
    let domain = schema.index_of("domain").context("schema has no domain column")?;
    let duration = schema.index_of("duration").context("schema has no duration column")?;

    let mut builder = BatchBuilder::new(schema);
    for i in offset..offset + rows {
        let mut row = vec![Value::Null; schema.fields().len()];
        row[schema.timestamp_index()] = Value::Int(1_700_000_000_000 + i as i64 * 50);
        row[1] = Value::Int(i as i64);
        row[page] = PAGES[i % PAGES.len()].into();
        row[browser] = BROWSERS[i % BROWSERS.len()].into();
        row[domain] = RESOURCE.into();
        row[duration] = Value::Int((i % 600) as i64);
        builder.append_row(row)?;
    }
    Ok(builder.finish()?)
}

// ── RSS measurement ────────────────────────────────────────────────────

fn get_process_rss() -> u64 {
    let mut sys = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::everything()),
    );
    sys.refresh_all();
    sysinfo::get_current_pid()
        .ok()
        .and_then(|pid| sys.process(pid).map(|p| p.memory()))
        .unwrap_or(0)
}

struct Sample {
    ingest_rss: u64,
    ingest_ms: u128,
    compact_ms: u128,
    flush_ms: u128,
    query_rows: usize,
}

fn profile(events: usize) -> Result<Sample> {
    // Let OS settle RSS from prior allocations
    std::thread::sleep(std::time::Duration::from_millis(100));
    let baseline = get_process_rss();

    let dir = TmpDir::new()?;
    let engine = Engine::open_dir(dir.path(), SchemaDescriptor::events())?;
    let schema = engine.schema().clone();

    let started = Instant::now();
    let mut offset = 0;
    while offset < events {
        let rows = BATCH_ROWS.min(events - offset);
        engine.add(RESOURCE, make_batch(&schema, offset, rows)?)?;
        offset += rows;
    }
    let ingest_ms = started.elapsed().as_millis();
    let ingest_rss = get_process_rss().saturating_sub(baseline);

    let started = Instant::now();
    engine.compact(RESOURCE)?;
    let compact_ms = started.elapsed().as_millis();

    let started = Instant::now();
    engine.close()?;
    let flush_ms = started.elapsed().as_millis();

    let filters = Filters::compile(vec![Filter::eq("page", "/pricing")])?;
    let out = engine.query(
        RESOURCE,
        i64::MIN,
        i64::MAX,
        &filters,
        &["timestamp".to_string()],
        &CancelToken::new(),
    )?;

    Ok(Sample {
        ingest_rss,
        ingest_ms,
        compact_ms,
        flush_ms,
        query_rows: out.num_rows(),
    })
}

// ── Main ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_writer(std::io::stderr)
        .init();

    println!("eventdb Ingest Profile");
    println!("======================");
    println!();
    println!(
        "{:<10} {:>12} {:>10} {:>11} {:>9} {:>10}",
        "Events", "RSS (MB)", "Ingest ms", "Compact ms", "Flush ms", "Matched"
    );
    println!("{:-<67}", "");

    for size in [10_000, 100_000, 1_000_000] {
        eprint!("Measuring {}... ", size);
        let s = profile(size)?;
        let rss_mb = s.ingest_rss as f64 / (1024.0 * 1024.0);
        println!(
            "{:<10} {:>12.1} {:>10} {:>11} {:>9} {:>10}",
            size, rss_mb, s.ingest_ms, s.compact_ms, s.flush_ms, s.query_rows
        );
        eprintln!("done");
    }

    println!();
    println!("Note: RSS is measured after ingest, before compaction.");
    Ok(())
}
