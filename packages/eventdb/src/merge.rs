//! Batch merging for compaction.
//!
//! Appends the rows of several batches into one, rebuilding dictionary
//! columns by value so that ordinals from different source batches never
//! collide. Sorting is a separate, explicit step.

use std::sync::Arc;

use arrow_array::builder::StringDictionaryBuilder;
use arrow_array::cast::AsArray;
use arrow_array::types::{Int32Type, Int64Type};
use arrow_array::{Array, ArrayRef, RecordBatch, UInt32Array};
use arrow_select::concat::concat;
use arrow_select::take::take_record_batch;

use crate::error::{EngineError, Result};
use crate::index::column::as_dictionary;
use crate::schema::{ColumnKind, SchemaDescriptor};

/// Merge batches of identical schema into one batch, in input order.
///
/// Complexity: O(N) in total rows, plus dictionary re-interning.
pub fn merge_batches(schema: &SchemaDescriptor, batches: &[&RecordBatch]) -> Result<RecordBatch> {
    if batches.is_empty() {
        return Ok(RecordBatch::new_empty(schema.arrow().clone()));
    }
    for batch in batches {
        schema.check(batch.schema().as_ref())?;
    }

    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    for (i, field) in schema.fields().iter().enumerate() {
        let arrays: Vec<&dyn Array> = batches.iter().map(|b| b.column(i).as_ref()).collect();
        let merged = match field.kind {
            ColumnKind::Text => rebuild_dictionary(&field.name, &arrays)?,
            _ => concat(&arrays)?,
        };
        columns.push(merged);
    }

    Ok(RecordBatch::try_new(schema.arrow().clone(), columns)?)
}

fn rebuild_dictionary(name: &str, arrays: &[&dyn Array]) -> Result<ArrayRef> {
    let rows = arrays.iter().map(|a| a.len()).sum();
    let mut builder = StringDictionaryBuilder::<Int32Type>::with_capacity(rows, 256, rows * 8);
    for array in arrays {
        let dict = as_dictionary(name, *array)?;
        let values = dict.values().as_string_opt::<i32>().ok_or_else(|| {
            EngineError::UnsupportedColumn {
                column: name.to_string(),
                reason: format!("dictionary values are {}", dict.values().data_type()),
            }
        })?;
        for key in dict.keys().iter() {
            match key {
                Some(k) if values.is_valid(k as usize) => {
                    builder.append(values.value(k as usize))?;
                }
                _ => builder.append_null(),
            }
        }
    }
    Ok(Arc::new(builder.finish()))
}

/// Stable sort by the timestamp column; ties keep their input order.
///
/// Already-sorted batches are returned as-is without copying columns.
pub fn sort_by_timestamp(batch: &RecordBatch, timestamp: usize) -> Result<RecordBatch> {
    let ts = batch
        .column(timestamp)
        .as_primitive_opt::<Int64Type>()
        .ok_or_else(|| {
            EngineError::SchemaMismatch(format!(
                "timestamp column is {}, expected Int64",
                batch.column(timestamp).data_type()
            ))
        })?;
    let values = ts.values();
    if values.windows(2).all(|w| w[0] <= w[1]) {
        return Ok(batch.clone());
    }

    let mut order: Vec<u32> = (0..values.len() as u32).collect();
    order.sort_by_key(|&i| values[i as usize]);
    let indices = UInt32Array::from(order);
    Ok(take_record_batch(batch, &indices)?)
}
