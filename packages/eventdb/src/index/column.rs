//! Per-column inverted index: sorted distinct values, one bitmap each.
//!
//! Ordinals are dense positions in the sorted value list, so value lookup is
//! O(log K) by binary search and regex matching enumerates K values instead
//! of N rows.

use std::io::{Read, Write};

use arrow_array::cast::AsArray;
use arrow_array::types::Int32Type;
use arrow_array::{Array, DictionaryArray};
use regex_lite::Regex;
use roaring::RoaringBitmap;

use crate::bsi::{read_bitmap, write_bitmap};
use crate::error::{EngineError, Result};

/// Sorted value -> ordinal map plus one row bitmap per ordinal.
///
/// Invariant: bitmaps are pairwise disjoint and their cardinalities sum to
/// the column's non-null row count.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnIndex {
    /// Distinct non-null values, strictly ascending.
    values: Vec<String>,
    /// `bitmaps[ordinal]` holds the rows carrying `values[ordinal]`.
    bitmaps: Vec<RoaringBitmap>,
}

impl ColumnIndex {
    /// Build from a dictionary-coded string column.
    ///
    /// Dictionary entries no row references are dropped, and duplicate
    /// dictionary values collapse into one ordinal.
    ///
    /// Complexity: O(N + D log D) for N rows, D dictionary entries.
    pub fn build(name: &str, column: &DictionaryArray<Int32Type>) -> Result<Self> {
        let dict = column.values().as_string_opt::<i32>().ok_or_else(|| {
            EngineError::UnsupportedColumn {
                column: name.to_string(),
                reason: format!("dictionary values are {}, expected Utf8", column.values().data_type()),
            }
        })?;
        let keys = column.keys();

        let mut used = vec![false; dict.len()];
        for key in keys.iter().flatten() {
            let key = usize::try_from(key).ok().filter(|&k| k < dict.len()).ok_or_else(|| {
                EngineError::UnsupportedColumn {
                    column: name.to_string(),
                    reason: format!("dictionary key {} out of range", key),
                }
            })?;
            used[key] = true;
        }

        let mut referenced: Vec<(&str, usize)> = used
            .iter()
            .enumerate()
            .filter(|&(k, &u)| u && dict.is_valid(k))
            .map(|(k, _)| (dict.value(k), k))
            .collect();
        referenced.sort_unstable();

        // Dictionary key -> ordinal. u32::MAX marks null/unused entries.
        let mut ordinal_of = vec![u32::MAX; dict.len()];
        let mut values: Vec<String> = Vec::new();
        for (value, key) in referenced {
            if values.last().map(String::as_str) != Some(value) {
                values.push(value.to_string());
            }
            ordinal_of[key] = (values.len() - 1) as u32;
        }

        let mut bitmaps = vec![RoaringBitmap::new(); values.len()];
        for (row, key) in keys.iter().enumerate() {
            let Some(key) = key else { continue };
            let ordinal = ordinal_of[key as usize];
            if ordinal != u32::MAX {
                // Rows ascend, so push appends without a search.
                bitmaps[ordinal as usize].push(row as u32);
            }
        }

        Ok(Self { values, bitmaps })
    }

    /// Rows equal to `value`. O(log K).
    pub fn lookup(&self, value: &str) -> Option<&RoaringBitmap> {
        self.values
            .binary_search_by(|v| v.as_str().cmp(value))
            .ok()
            .map(|ordinal| &self.bitmaps[ordinal])
    }

    /// Union of the bitmaps of every value matching `re`.
    pub fn regex_union(&self, re: &Regex) -> RoaringBitmap {
        let mut out = RoaringBitmap::new();
        for (value, bitmap) in self.values.iter().zip(&self.bitmaps) {
            if re.is_match(value) {
                out |= bitmap;
            }
        }
        out
    }

    /// Distinct indexed values in ascending order.
    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// Number of distinct values (K).
    pub fn cardinality(&self) -> usize {
        self.values.len()
    }

    /// Number of indexed (non-null) rows.
    pub fn row_count(&self) -> u64 {
        self.bitmaps.iter().map(RoaringBitmap::len).sum()
    }

    pub(crate) fn bitmaps(&self) -> &[RoaringBitmap] {
        &self.bitmaps
    }

    pub fn serialized_size(&self) -> usize {
        4 + self
            .values
            .iter()
            .zip(&self.bitmaps)
            .map(|(v, b)| 4 + v.len() + 4 + b.serialized_size())
            .sum::<usize>()
    }

    /// Binary layout:
    ///
    /// ```text
    /// [value_count: u32 LE]
    /// [value_len: u32 LE][value: utf8] x value_count
    /// [bitmap_len: u32 LE][roaring bytes] x value_count
    /// ```
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&(self.values.len() as u32).to_le_bytes())?;
        for value in &self.values {
            w.write_all(&(value.len() as u32).to_le_bytes())?;
            w.write_all(value.as_bytes())?;
        }
        for bitmap in &self.bitmaps {
            write_bitmap(bitmap, w)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let count = read_u32(r, "value count")? as usize;
        let mut values: Vec<String> = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            let len = read_u32(r, "value length")? as usize;
            let mut buf = vec![0u8; len];
            r.read_exact(&mut buf).map_err(|e| {
                EngineError::InvalidFormat(format!("Column value truncated: {}", e))
            })?;
            let value = String::from_utf8(buf).map_err(|_| {
                EngineError::InvalidFormat("Column value contains invalid UTF-8".into())
            })?;
            if values.last().is_some_and(|prev| prev.as_str() >= value.as_str()) {
                return Err(EngineError::InvalidFormat(
                    "Column values not strictly ascending".into(),
                ));
            }
            values.push(value);
        }
        let mut bitmaps = Vec::with_capacity(values.len());
        for _ in 0..count {
            bitmaps.push(read_bitmap(r)?);
        }
        Ok(Self { values, bitmaps })
    }
}

/// Downcast helper shared with the index builder.
pub(crate) fn as_dictionary<'a>(
    name: &str,
    array: &'a dyn Array,
) -> Result<&'a DictionaryArray<Int32Type>> {
    array
        .as_dictionary_opt::<Int32Type>()
        .ok_or_else(|| EngineError::UnsupportedColumn {
            column: name.to_string(),
            reason: format!("expected Dictionary(Int32, Utf8), got {}", array.data_type()),
        })
}

pub(crate) fn read_u32<R: Read>(r: &mut R, what: &str) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|e| EngineError::InvalidFormat(format!("Failed to read {}: {}", what, e)))?;
    Ok(u32::from_le_bytes(buf))
}
