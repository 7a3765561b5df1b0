//! In-memory part tree: a lock-free, prepend-only linked list of parts.
//!
//! ```text
//! head -> [P5] -> [P4] -> [merged P1..P3] -> null
//! ```
//!
//! - `add` builds a part off-list, then publishes it with one CAS on `head`.
//! - `scan` pins the epoch, retains (`Arc`) every overlapping part, unpins,
//!   and only then touches batch data.
//! - `compact` snapshots the chain, merges and optionally persists it, then
//!   swaps the link pointing at the snapshot head for a single replacement
//!   node. Parts prepended after the snapshot stay attached.
//!
//! Node memory is reclaimed through crossbeam-epoch; part memory through
//! `Arc`, so a scan holding a detached part keeps it alive.
//!
//! Compactions of one tree are serialized by an internal mutex. `add` and
//! `scan` never take it.

use std::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use arrow_array::RecordBatch;
use arrow_select::concat::concat_batches;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use tracing::{debug, error, info};

use crate::bsi::Aggregate;
use crate::config::CompactionConfig;
use crate::error::{EngineError, Result};
use crate::filter::Filters;
use crate::granule::Granule;
use crate::merge::{merge_batches, sort_by_timestamp};
use crate::part::Part;
use crate::schema::{ColumnKind, SchemaDescriptor};

/// Destination for parts that compaction decides to persist.
///
/// `write` makes the granule's blobs durable but unreachable. `register`
/// makes it visible to readers; once it returns the tree drops the
/// in-memory copy.
pub trait GranuleSink: Send + Sync {
    fn write(&self, resource: &str, part: &Part) -> Result<Granule>;

    fn register(&self, resource: &str, granule: &Granule) -> Result<()>;
}

/// Cooperative cancellation flag, checked between parts.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Live parts (placeholders excluded)
    pub parts: usize,
    pub rows: usize,
    /// Sum of `Part::size` over live parts
    pub bytes: usize,
}

/// Result of one compaction cycle.
#[derive(Debug, Clone, Default)]
pub struct CompactionResult {
    /// Parts folded into the output (0 when the cycle was skipped)
    pub parts_merged: usize,
    pub rows: usize,
    /// Set when the output went to durable storage instead of the tree
    pub granule: Option<Granule>,
    pub duration_ms: u64,
}

impl CompactionResult {
    pub fn is_noop(&self) -> bool {
        self.parts_merged == 0
    }
}

struct Node {
    /// `None` for placeholders left behind by a persisting compaction.
    part: Option<Arc<Part>>,
    next: Atomic<Node>,
}

/// Parts retained from one traversal, newest first, plus the head node the
/// traversal started from.
struct Snapshot {
    head: *const Node,
    parts: Vec<Arc<Part>>,
}

pub struct Tree {
    resource: String,
    schema: Arc<SchemaDescriptor>,
    head: Atomic<Node>,
    bytes: AtomicUsize,
    compacting: Mutex<()>,
    /// Odd while a persisting compaction is between `register` and detach.
    publish_seq: AtomicU64,
}

/// Holds `publish_seq` odd for its lifetime.
struct Publishing<'a>(&'a AtomicU64);

impl<'a> Publishing<'a> {
    fn begin(seq: &'a AtomicU64) -> Self {
        seq.fetch_add(1, Ordering::SeqCst);
        Self(seq)
    }
}

impl Drop for Publishing<'_> {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl Tree {
    pub fn new(resource: impl Into<String>, schema: Arc<SchemaDescriptor>) -> Self {
        Self {
            resource: resource.into(),
            schema,
            head: Atomic::null(),
            bytes: AtomicUsize::new(0),
            compacting: Mutex::new(()),
            publish_seq: AtomicU64::new(0),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn schema(&self) -> &Arc<SchemaDescriptor> {
        &self.schema
    }

    /// Index `batch` and make it visible to scans. Empty batches are a no-op.
    ///
    /// Unsorted input is stable-sorted first; indexing failures reject the
    /// whole batch and leave the tree unchanged.
    pub fn add(&self, batch: RecordBatch) -> Result<()> {
        self.schema.check(batch.schema().as_ref())?;
        if batch.num_rows() == 0 {
            return Ok(());
        }
        let batch = sort_by_timestamp(&batch, self.schema.timestamp_index())?;
        let part = Part::new(batch, &self.schema)?;
        debug!(
            resource = %self.resource,
            rows = part.rows(),
            bytes = part.size(),
            "Added part"
        );
        self.push(Arc::new(part));
        Ok(())
    }

    fn push(&self, part: Arc<Part>) {
        let size = part.size();
        let guard = &epoch::pin();
        let mut node = Owned::new(Node {
            part: Some(part),
            next: Atomic::null(),
        });
        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            node.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange(head, node, Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(_) => break,
                Err(e) => node = e.new,
            }
        }
        self.bytes.fetch_add(size, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Snapshot {
        let guard = &epoch::pin();
        let head = self.head.load(Ordering::Acquire, guard);
        let mut parts = Vec::new();
        let mut cur = head;
        // SAFETY: nodes reachable from `head` are only retired after being
        // unlinked, and never freed while this guard is pinned.
        while let Some(node) = unsafe { cur.as_ref() } {
            if let Some(part) = &node.part {
                parts.push(Arc::clone(part));
            }
            cur = node.next.load(Ordering::Acquire, guard);
        }
        Snapshot {
            head: head.as_raw(),
            parts,
        }
    }

    /// Rows in `[start, end]` passing `filters`, projected to `projection`
    /// (empty = all columns). Parts are concatenated newest first; rows are
    /// not re-sorted across parts.
    pub fn scan(
        &self,
        start: i64,
        end: i64,
        filters: &Filters,
        projection: &[String],
    ) -> Result<RecordBatch> {
        self.scan_cancellable(start, end, filters, projection, &CancelToken::new())
    }

    pub fn scan_cancellable(
        &self,
        start: i64,
        end: i64,
        filters: &Filters,
        projection: &[String],
        cancel: &CancelToken,
    ) -> Result<RecordBatch> {
        let columns = self.schema.projection(projection)?;
        let parts = self.overlapping(start, end);
        let selected = select_parts(&parts, start, end, filters, &columns, cancel)?;

        let schema = Arc::new(self.schema.arrow().project(&columns)?);
        let out = concat_batches(&schema, &selected)?;
        debug!(
            resource = %self.resource,
            parts = parts.len(),
            rows = out.num_rows(),
            "Scanned tree"
        );
        Ok(out)
    }

    /// Sum/count of an `int64` column over the rows a scan would return.
    pub fn aggregate(
        &self,
        start: i64,
        end: i64,
        filters: &Filters,
        column: &str,
    ) -> Result<Aggregate> {
        check_metric(&self.schema, column)?;
        let mut total = Aggregate::default();
        for part in self.overlapping(start, end) {
            total.merge(part.aggregate(start, end, filters, column));
        }
        Ok(total)
    }

    fn overlapping(&self, start: i64, end: i64) -> Vec<Arc<Part>> {
        if start > end {
            return Vec::new();
        }
        let mut parts = self.snapshot().parts;
        parts.retain(|p| p.overlaps(start, end));
        parts
    }

    /// Run `read` so that it observes no persisting compaction midway
    /// between registering its granule and detaching its inputs.
    ///
    /// Callers that combine a tree scan with durable granule lookups use
    /// this to see every row exactly once. `read` is retried when a publish
    /// overlapped it.
    pub fn read_stable<T>(
        &self,
        cancel: &CancelToken,
        mut read: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        loop {
            let before = self.publish_seq.load(Ordering::SeqCst);
            if before % 2 == 0 {
                let out = read()?;
                fence(Ordering::SeqCst);
                if self.publish_seq.load(Ordering::SeqCst) == before {
                    return Ok(out);
                }
            }
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn stats(&self) -> TreeStats {
        let parts = self.snapshot().parts;
        TreeStats {
            parts: parts.len(),
            rows: parts.iter().map(|p| p.rows()).sum(),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }

    /// One compaction cycle under `config`'s policy.
    pub fn compact(&self, config: &CompactionConfig, sink: &dyn GranuleSink) -> Result<CompactionResult> {
        self.compact_with(
            |parts| config.should_compact(parts),
            |part| config.should_persist(part),
            sink,
        )
    }

    /// Merge and persist every live part regardless of size or age.
    pub fn flush(&self, sink: &dyn GranuleSink) -> Result<CompactionResult> {
        self.compact_with(|parts| !parts.is_empty(), |_| true, sink)
    }

    fn compact_with(
        &self,
        should_compact: impl Fn(&[&Part]) -> bool,
        should_persist: impl Fn(&Part) -> bool,
        sink: &dyn GranuleSink,
    ) -> Result<CompactionResult> {
        let _serial = self.compacting.lock().unwrap_or_else(|e| e.into_inner());
        let started = Instant::now();

        let snapshot = self.snapshot();
        let inputs: Vec<&Part> = snapshot.parts.iter().map(Arc::as_ref).collect();
        if inputs.is_empty() || !should_compact(&inputs) {
            return Ok(CompactionResult::default());
        }
        let single_kept = inputs.len() == 1 && !should_persist(inputs[0]);
        if single_kept {
            return Ok(CompactionResult::default());
        }

        let merged = self.merge(&snapshot.parts)?;
        let rows = merged.rows();
        debug_assert_eq!(rows, inputs.iter().map(|p| p.rows()).sum::<usize>());

        let input_bytes: usize = inputs.iter().map(|p| p.size()).sum();
        let (granule, kept_bytes) = if should_persist(merged.as_ref()) {
            let granule = sink.write(&self.resource, merged.as_ref())?;
            let _publishing = Publishing::begin(&self.publish_seq);
            sink.register(&self.resource, &granule)?;
            self.replace_chain(snapshot.head, None);
            (Some(granule), 0)
        } else {
            let kept = merged.size();
            self.replace_chain(snapshot.head, Some(merged));
            (None, kept)
        };
        self.bytes.fetch_add(kept_bytes, Ordering::Relaxed);
        self.bytes.fetch_sub(input_bytes, Ordering::Relaxed);

        let result = CompactionResult {
            parts_merged: inputs.len(),
            rows,
            granule,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            resource = %self.resource,
            parts = result.parts_merged,
            rows,
            persisted = result.granule.is_some(),
            duration_ms = result.duration_ms,
            "Compacted tree"
        );
        Ok(result)
    }

    /// Merge snapshot parts (newest first) into one part in ingestion order.
    fn merge(&self, parts: &[Arc<Part>]) -> Result<Arc<Part>> {
        if let [only] = parts {
            return Ok(Arc::clone(only));
        }
        let batches: Vec<&RecordBatch> = parts.iter().rev().map(|p| p.batch()).collect();
        let merged = merge_batches(&self.schema, &batches)?;
        let sorted = sort_by_timestamp(&merged, self.schema.timestamp_index())?;
        let born = parts.iter().map(|p| p.born()).min().unwrap_or_else(Instant::now);
        Ok(Arc::new(Part::new(sorted, &self.schema)?.with_born(born)))
    }

    /// Swap the link that points at `snapshot_head` for a single node
    /// holding `replacement`, and retire the detached chain.
    ///
    /// Only compaction unlinks nodes and it holds `compacting`, so the
    /// snapshot head stays reachable and the chain behind it is unchanged.
    fn replace_chain(&self, snapshot_head: *const Node, replacement: Option<Arc<Part>>) {
        let guard = &epoch::pin();
        let mut new = Owned::new(Node {
            part: replacement,
            next: Atomic::null(),
        });

        loop {
            let mut link = &self.head;
            let mut cur = link.load(Ordering::Acquire, guard);
            while cur.as_raw() != snapshot_head {
                // SAFETY: pinned; nodes ahead of the snapshot are never retired.
                match unsafe { cur.as_ref() } {
                    Some(node) => {
                        link = &node.next;
                        cur = link.load(Ordering::Acquire, guard);
                    }
                    None => {
                        debug_assert!(false, "snapshot head no longer reachable");
                        error!(resource = %self.resource, "Snapshot head not found; compaction output dropped");
                        return;
                    }
                }
            }

            match link.compare_exchange(cur, new, Ordering::AcqRel, Ordering::Acquire, guard) {
                Ok(_) => {
                    retire_chain(cur, guard);
                    return;
                }
                // A concurrent add moved `head`; walk again.
                Err(e) => new = e.new,
            }
        }
    }
}

fn retire_chain<'g>(mut cur: Shared<'g, Node>, guard: &'g Guard) {
    // SAFETY: the chain was unlinked by a successful CAS, so no new reader
    // can reach it; existing readers are protected by their own pins.
    while let Some(node) = unsafe { cur.as_ref() } {
        let next = node.next.load(Ordering::Acquire, guard);
        unsafe { guard.defer_destroy(cur) };
        cur = next;
    }
}

pub(crate) fn select_parts(
    parts: &[Arc<Part>],
    start: i64,
    end: i64,
    filters: &Filters,
    columns: &[usize],
    cancel: &CancelToken,
) -> Result<Vec<RecordBatch>> {
    let mut out = Vec::new();
    for part in parts {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if let Some(batch) = part.select(start, end, filters, columns)? {
            out.push(batch);
        }
    }
    Ok(out)
}

pub(crate) fn check_metric(schema: &SchemaDescriptor, column: &str) -> Result<()> {
    let idx = schema
        .index_of(column)
        .ok_or_else(|| EngineError::UnknownColumn(column.to_string()))?;
    if schema.fields()[idx].kind != ColumnKind::Int64 {
        return Err(EngineError::SchemaMismatch(format!(
            "column '{}' is not an int64 metric",
            column
        )));
    }
    Ok(())
}

impl Drop for Tree {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread can reach the list.
        unsafe {
            let guard = epoch::unprotected();
            let mut cur = self.head.load(Ordering::Relaxed, guard);
            while let Some(node) = cur.as_ref() {
                let next = node.next.load(Ordering::Relaxed, guard);
                drop(cur.into_owned());
                cur = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchBuilder, Value};
    use crate::filter::Filter;
    use crate::schema::FieldDescriptor;
    use arrow_array::cast::AsArray;
    use arrow_array::types::Int64Type;
    use std::sync::Mutex as StdMutex;

    fn schema() -> Arc<SchemaDescriptor> {
        Arc::new(
            SchemaDescriptor::new(
                1,
                vec![
                    FieldDescriptor::new("timestamp", ColumnKind::Timestamp, false),
                    FieldDescriptor::new("domain", ColumnKind::Text, true),
                    FieldDescriptor::new("view", ColumnKind::Boolean, true),
                    FieldDescriptor::new("duration", ColumnKind::Int64, true),
                ],
            )
            .unwrap(),
        )
    }

    fn batch(schema: &SchemaDescriptor, rows: &[(i64, &str, bool)]) -> RecordBatch {
        let mut b = BatchBuilder::new(schema);
        for &(ts, domain, view) in rows {
            b.append_row(vec![
                Value::Int(ts),
                domain.into(),
                view.into(),
                Value::Int(ts / 10),
            ])
            .unwrap();
        }
        b.finish().unwrap()
    }

    fn timestamps(batch: &RecordBatch) -> Vec<i64> {
        let mut ts = batch
            .column(0)
            .as_primitive::<Int64Type>()
            .values()
            .to_vec();
        ts.sort();
        ts
    }

    #[derive(Default)]
    struct RecordingSink {
        written: AtomicUsize,
        granules: StdMutex<Vec<(String, usize)>>,
        fail: AtomicBool,
        fail_register: AtomicBool,
    }

    impl GranuleSink for RecordingSink {
        fn write(&self, _resource: &str, part: &Part) -> Result<Granule> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(EngineError::StorageBusy);
            }
            let n = self.written.fetch_add(1, Ordering::SeqCst);
            Ok(Granule {
                id: format!("g{}", n),
                min: part.min(),
                max: part.max(),
                size: part.size() as u64,
                rows: part.rows() as u64,
            })
        }

        fn register(&self, resource: &str, granule: &Granule) -> Result<()> {
            if self.fail_register.load(Ordering::SeqCst) {
                return Err(EngineError::StorageBusy);
            }
            let mut granules = self.granules.lock().unwrap();
            granules.push((resource.to_string(), granule.rows as usize));
            Ok(())
        }
    }

    fn seeded() -> Tree {
        let schema = schema();
        let tree = Tree::new("site", schema.clone());
        tree.add(batch(&schema, &[(100, "a", true), (200, "a", false), (300, "b", true)]))
            .unwrap();
        tree.add(batch(&schema, &[(150, "a", true), (400, "b", false)]))
            .unwrap();
        tree
    }

    #[test]
    fn test_scan_range_and_filter() {
        let tree = seeded();
        let filters = Filters::compile(vec![Filter::eq("domain", "a")]).unwrap();
        let out = tree.scan(0, 250, &filters, &[]).unwrap();
        assert_eq!(timestamps(&out), vec![100, 150, 200]);
    }

    #[test]
    fn test_scan_traversal_order_newest_first() {
        let tree = seeded();
        let out = tree.scan(0, 1000, &Filters::none(), &[]).unwrap();
        let ts = out.column(0).as_primitive::<Int64Type>().values().to_vec();
        assert_eq!(ts, vec![150, 400, 100, 200, 300]);
    }

    #[test]
    fn test_scan_projection() {
        let tree = seeded();
        let out = tree
            .scan(0, 1000, &Filters::none(), &["domain".to_string()])
            .unwrap();
        assert_eq!(out.num_columns(), 1);
        assert_eq!(out.schema().field(0).name(), "domain");
        assert_eq!(out.num_rows(), 5);
    }

    #[test]
    fn test_unknown_projection_on_empty_tree() {
        let tree = Tree::new("site", schema());
        let err = tree
            .scan(0, 1, &Filters::none(), &["nope".to_string()])
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownColumn(_)));
        assert_eq!(tree.scan(0, 1, &Filters::none(), &[]).unwrap().num_rows(), 0);
    }

    #[test]
    fn test_cancelled_scan() {
        let tree = seeded();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = tree
            .scan_cancellable(0, 1000, &Filters::none(), &[], &cancel)
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[test]
    fn test_add_unsorted_and_empty() {
        let schema = schema();
        let tree = Tree::new("site", schema.clone());
        tree.add(RecordBatch::new_empty(schema.arrow().clone())).unwrap();
        assert_eq!(tree.stats().parts, 0);

        let b = batch(&schema, &[(5, "x", true), (1, "y", true)]);
        tree.add(b).unwrap();
        let out = tree.scan(0, 10, &Filters::none(), &[]).unwrap();
        let ts = out.column(0).as_primitive::<Int64Type>().values().to_vec();
        assert_eq!(ts, vec![1, 5]);
    }

    #[test]
    fn test_compact_in_memory_conserves_rows() {
        let tree = seeded();
        let before = tree.scan(0, 1000, &Filters::none(), &[]).unwrap();
        let sink = RecordingSink::default();

        let result = tree.compact(&CompactionConfig::default(), &sink).unwrap();
        assert_eq!(result.parts_merged, 2);
        assert_eq!(result.rows, 5);
        assert!(result.granule.is_none());
        assert!(sink.granules.lock().unwrap().is_empty());

        let stats = tree.stats();
        assert_eq!((stats.parts, stats.rows), (1, 5));

        let after = tree.scan(0, 1000, &Filters::none(), &[]).unwrap();
        assert_eq!(timestamps(&after), timestamps(&before));
        // Merged part is globally sorted.
        let ts = after.column(0).as_primitive::<Int64Type>().values().to_vec();
        assert_eq!(ts, vec![100, 150, 200, 300, 400]);

        // One part left: nothing to do.
        assert!(tree.compact(&CompactionConfig::default(), &sink).unwrap().is_noop());
    }

    #[test]
    fn test_compact_persists_and_detaches() {
        let tree = seeded();
        let sink = RecordingSink::default();
        let config = CompactionConfig {
            persist_bytes: 0,
            ..CompactionConfig::default()
        };
        let result = tree.compact(&config, &sink).unwrap();
        assert_eq!(result.granule.as_ref().map(|g| g.rows), Some(5));
        assert_eq!(sink.granules.lock().unwrap().as_slice(), &[("site".to_string(), 5)]);
        assert_eq!(tree.stats(), TreeStats::default());
        assert_eq!(tree.scan(0, 1000, &Filters::none(), &[]).unwrap().num_rows(), 0);

        // Placeholder only: nothing to compact.
        assert!(tree.compact(&config, &sink).unwrap().is_noop());
    }

    #[test]
    fn test_failed_persist_leaves_tree_unchanged() {
        let tree = seeded();
        let sink = RecordingSink::default();
        sink.fail.store(true, Ordering::SeqCst);
        assert!(tree.flush(&sink).is_err());
        let stats = tree.stats();
        assert_eq!((stats.parts, stats.rows), (2, 5));
    }

    #[test]
    fn test_failed_register_leaves_tree_unchanged() {
        let tree = seeded();
        let sink = RecordingSink::default();
        sink.fail_register.store(true, Ordering::SeqCst);
        assert!(tree.flush(&sink).is_err());
        assert_eq!(sink.written.load(Ordering::SeqCst), 1);
        assert!(sink.granules.lock().unwrap().is_empty());
        assert_eq!(tree.stats().rows, 5);
        // The publish window is closed again after the failure.
        assert_eq!(tree.publish_seq.load(Ordering::SeqCst) % 2, 0);
    }

    #[test]
    fn test_parts_added_after_snapshot_stay_attached() {
        let tree = seeded();
        let snapshot = tree.snapshot();
        let schema = tree.schema().clone();
        tree.add(batch(&schema, &[(500, "c", true)])).unwrap();

        let merged = tree.merge(&snapshot.parts).unwrap();
        tree.replace_chain(snapshot.head, Some(merged));

        let stats = tree.stats();
        assert_eq!((stats.parts, stats.rows), (2, 6));
        let out = tree.scan(0, 1000, &Filters::none(), &[]).unwrap();
        assert_eq!(timestamps(&out), vec![100, 150, 200, 300, 400, 500]);
    }

    #[test]
    fn test_detached_part_outlives_compaction() {
        let tree = seeded();
        let held = tree.snapshot().parts;
        tree.flush(&RecordingSink::default()).unwrap();
        assert_eq!(held.iter().map(|p| p.rows()).sum::<usize>(), 5);
    }

    #[test]
    fn test_read_stable_waits_for_publish() {
        let tree = seeded();
        let cancel = CancelToken::new();
        assert_eq!(tree.read_stable(&cancel, || Ok(tree.stats().rows)).unwrap(), 5);

        let publishing = Publishing::begin(&tree.publish_seq);
        cancel.cancel();
        let err = tree.read_stable(&cancel, || Ok(())).unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        drop(publishing);

        // A publish that overlaps the read forces one retry.
        let mut calls = 0;
        let out = tree
            .read_stable(&CancelToken::new(), || {
                calls += 1;
                if calls == 1 {
                    drop(Publishing::begin(&tree.publish_seq));
                }
                Ok(calls)
            })
            .unwrap();
        assert_eq!(out, 2);
    }

    #[test]
    fn test_aggregate() {
        let tree = seeded();
        let agg = tree
            .aggregate(0, 250, &Filters::none(), "duration")
            .unwrap();
        assert_eq!(agg, Aggregate { sum: 10 + 15 + 20, count: 3 });
        assert!(matches!(
            tree.aggregate(0, 1, &Filters::none(), "domain"),
            Err(EngineError::SchemaMismatch(_))
        ));
        assert!(matches!(
            tree.aggregate(0, 1, &Filters::none(), "nope"),
            Err(EngineError::UnknownColumn(_))
        ));
    }
}
