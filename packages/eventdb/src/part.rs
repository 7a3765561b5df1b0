//! Part: one immutable (batch, full index) pair.
//!
//! The unit the in-memory tree links together and compaction merges. Never
//! edited in place; any change builds a new Part.

use std::ops::Range;
use std::time::{Duration, Instant};

use arrow_array::cast::AsArray;
use arrow_array::types::Int64Type;
use arrow_array::{Array, RecordBatch, UInt32Array};
use arrow_select::take::take_record_batch;
use roaring::RoaringBitmap;

use crate::bsi::Aggregate;
use crate::error::{EngineError, Result};
use crate::filter::Filters;
use crate::index::FullIndex;
use crate::schema::SchemaDescriptor;

#[derive(Debug)]
pub struct Part {
    batch: RecordBatch,
    index: FullIndex,
    timestamp: usize,
    min: i64,
    max: i64,
    size: usize,
    born: Instant,
}

impl Part {
    /// Index a time-sorted batch. Fails without side effects if any column
    /// cannot be indexed.
    pub fn new(batch: RecordBatch, schema: &SchemaDescriptor) -> Result<Self> {
        schema.check(batch.schema().as_ref())?;
        let index = FullIndex::build(&batch, schema.timestamp())?;
        Self::from_parts(batch, index, schema.timestamp_index())
    }

    /// Reassemble a part from a persisted batch and its persisted index.
    pub fn from_persisted(
        batch: RecordBatch,
        index: FullIndex,
        schema: &SchemaDescriptor,
    ) -> Result<Self> {
        schema.check(batch.schema().as_ref())?;
        if index.row_count() as usize != batch.num_rows() {
            return Err(EngineError::InvalidFormat(format!(
                "index covers {} rows, batch has {}",
                index.row_count(),
                batch.num_rows()
            )));
        }
        let timestamp = schema.timestamp_index();
        let column = batch.column(timestamp);
        if column.null_count() == 0 {
            let ts = column.as_primitive::<Int64Type>().values();
            if let Some(i) = ts.windows(2).position(|w| w[0] > w[1]) {
                return Err(EngineError::InvalidFormat(format!(
                    "timestamps out of order at row {}",
                    i + 1
                )));
            }
        }
        Self::from_parts(batch, index, timestamp)
    }

    fn from_parts(batch: RecordBatch, index: FullIndex, timestamp: usize) -> Result<Self> {
        let column = batch.column(timestamp);
        if batch.num_rows() == 0 {
            return Err(EngineError::SchemaMismatch(
                "cannot build a part from an empty batch".into(),
            ));
        }
        if column.null_count() > 0 {
            return Err(EngineError::SchemaMismatch(
                "timestamp column contains nulls".into(),
            ));
        }
        let ts = column.as_primitive::<Int64Type>().values();
        debug_assert!(
            ts.windows(2).all(|w| w[0] <= w[1]),
            "part batch must be sorted by timestamp"
        );
        let (min, max) = (ts[0], ts[ts.len() - 1]);
        let size = index.serialized_size() + batch.get_array_memory_size();

        Ok(Self {
            batch,
            index,
            timestamp,
            min,
            max,
            size,
            born: Instant::now(),
        })
    }

    /// Carry the creation time of the oldest input through a compaction.
    pub(crate) fn with_born(mut self, born: Instant) -> Self {
        self.born = born;
        self
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn index(&self) -> &FullIndex {
        &self.index
    }

    pub fn min(&self) -> i64 {
        self.min
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    /// Index blob bytes plus in-memory batch footprint.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn born(&self) -> Instant {
        self.born
    }

    pub fn age(&self) -> Duration {
        self.born.elapsed()
    }

    /// `min <= end && start <= max`
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.min <= end && start <= self.max
    }

    /// Row span whose timestamps fall in `[start, end]`, by binary search.
    pub fn row_range(&self, start: i64, end: i64) -> Range<usize> {
        let ts = self
            .batch
            .column(self.timestamp)
            .as_primitive::<Int64Type>()
            .values();
        let lo = ts.partition_point(|&t| t < start);
        let hi = ts.partition_point(|&t| t <= end);
        lo..hi.max(lo)
    }

    /// Narrow `candidates` with this part's indexes.
    pub fn matches(&self, candidates: &mut RoaringBitmap, filters: &Filters) {
        filters.apply(candidates, &self.index);
    }

    fn selection(&self, start: i64, end: i64, filters: &Filters) -> Option<RoaringBitmap> {
        let rows = self.row_range(start, end);
        if rows.is_empty() {
            return None;
        }
        let mut candidates = RoaringBitmap::new();
        candidates.insert_range(rows.start as u32..rows.end as u32);
        self.matches(&mut candidates, filters);
        (!candidates.is_empty()).then_some(candidates)
    }

    /// Rows in `[start, end]` passing `filters`, restricted to `projection`.
    ///
    /// Returns `None` when nothing matches.
    pub fn select(
        &self,
        start: i64,
        end: i64,
        filters: &Filters,
        projection: &[usize],
    ) -> Result<Option<RecordBatch>> {
        if !self.overlaps(start, end) {
            return Ok(None);
        }
        let Some(selected) = self.selection(start, end, filters) else {
            return Ok(None);
        };
        let projected = self.batch.project(projection)?;

        // Contiguous selections are zero-copy slices.
        let (first, last) = match (selected.min(), selected.max()) {
            (Some(first), Some(last)) => (first as usize, last as usize),
            _ => return Ok(None),
        };
        if selected.len() as usize == last - first + 1 {
            return Ok(Some(projected.slice(first, selected.len() as usize)));
        }

        let indices = UInt32Array::from_iter_values(selected.iter());
        Ok(Some(take_record_batch(&projected, &indices)?))
    }

    /// Sum and count of an indexed integer column over the selected rows.
    pub fn aggregate(&self, start: i64, end: i64, filters: &Filters, column: &str) -> Aggregate {
        if !self.overlaps(start, end) {
            return Aggregate::default();
        }
        match (self.index.bsi(column), self.selection(start, end, filters)) {
            (Some(bsi), Some(selected)) => bsi.sum(&selected),
            _ => Aggregate::default(),
        }
    }
}
