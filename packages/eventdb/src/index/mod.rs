//! Full index for one batch: a [`ColumnIndex`] per dictionary-coded string
//! column and a [`Bsi`] per integer metric column.
//!
//! Provides:
//! - `column` -- sorted value -> bitmap index for one string column
//! - `format` -- blob header and name encoding
//!
//! The timestamp column is deliberately not indexed: batches are time-sorted
//! and range lookups binary-search the column directly.

pub mod column;
pub mod format;

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use arrow_array::cast::AsArray;
use arrow_array::types::Int64Type;
use arrow_array::{Array, RecordBatch};
use arrow_schema::DataType;

use crate::bsi::Bsi;
use crate::error::{EngineError, Result};

pub use column::ColumnIndex;
pub use format::{IndexHeader, INDEX_MAGIC, INDEX_VERSION};

use column::as_dictionary;
use format::{read_name, write_name, HEADER_SIZE};

/// Every column index built for one batch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FullIndex {
    row_count: u32,
    text: BTreeMap<String, ColumnIndex>,
    ints: BTreeMap<String, Bsi>,
}

impl FullIndex {
    /// Index every dictionary column and every non-timestamp Int64 column.
    ///
    /// Columns that are entirely null are skipped at zero cost; a filter on
    /// them later matches nothing. Any unsupported dictionary encoding fails
    /// the whole build so a batch is never half-indexed.
    pub fn build(batch: &RecordBatch, timestamp: &str) -> Result<Self> {
        let row_count = u32::try_from(batch.num_rows()).map_err(|_| {
            EngineError::SchemaMismatch(format!("batch of {} rows is too large", batch.num_rows()))
        })?;

        let mut text = BTreeMap::new();
        let mut ints = BTreeMap::new();
        let schema = batch.schema();

        for (field, array) in schema.fields().iter().zip(batch.columns()) {
            let name = field.name();
            if name == timestamp || array.null_count() == array.len() {
                continue;
            }
            match field.data_type() {
                DataType::Dictionary(_, _) => {
                    let dict = as_dictionary(name, array.as_ref())?;
                    text.insert(name.clone(), ColumnIndex::build(name, dict)?);
                }
                DataType::Int64 => {
                    let values = array.as_primitive::<Int64Type>();
                    let mut bsi = Bsi::new();
                    for (row, value) in values.iter().enumerate() {
                        if let Some(v) = value {
                            bsi.set_value(row as u32, v);
                        }
                    }
                    ints.insert(name.clone(), bsi);
                }
                _ => {}
            }
        }

        Ok(Self {
            row_count,
            text,
            ints,
        })
    }

    pub fn row_count(&self) -> u32 {
        self.row_count
    }

    pub fn column(&self, name: &str) -> Option<&ColumnIndex> {
        self.text.get(name)
    }

    pub fn bsi(&self, name: &str) -> Option<&Bsi> {
        self.ints.get(name)
    }

    /// Names of the indexed string columns, sorted.
    pub fn text_columns(&self) -> impl Iterator<Item = &str> {
        self.text.keys().map(String::as_str)
    }

    /// Names of the indexed integer columns, sorted.
    pub fn int_columns(&self) -> impl Iterator<Item = &str> {
        self.ints.keys().map(String::as_str)
    }

    /// Exact byte length of [`FullIndex::to_bytes`].
    pub fn serialized_size(&self) -> usize {
        HEADER_SIZE
            + self
                .text
                .iter()
                .map(|(n, c)| 2 + n.len() + c.serialized_size())
                .sum::<usize>()
            + self
                .ints
                .iter()
                .map(|(n, b)| 2 + n.len() + b.serialized_size())
                .sum::<usize>()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Cursor::new(Vec::with_capacity(self.serialized_size()));
        IndexHeader::new(self.row_count, self.text.len() as u32, self.ints.len() as u32)
            .write_to(&mut buf)?;
        for (name, index) in &self.text {
            write_name(name, &mut buf)?;
            index.write_to(&mut buf)?;
        }
        for (name, bsi) in &self.ints {
            write_name(name, &mut buf)?;
            bsi.write_to(&mut buf)?;
        }
        Ok(buf.into_inner())
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let header = IndexHeader::read_from(&mut cursor)?;

        let mut text = BTreeMap::new();
        for _ in 0..header.text_columns {
            let name = read_name(&mut cursor)?;
            let index = ColumnIndex::read_from(&mut cursor)?;
            if index.bitmaps().iter().any(|b| b.max().is_some_and(|m| m >= header.row_count)) {
                return Err(EngineError::InvalidFormat(format!(
                    "Column '{}' references rows past {}",
                    name, header.row_count
                )));
            }
            text.insert(name, index);
        }

        let mut ints = BTreeMap::new();
        for _ in 0..header.int_columns {
            let name = read_name(&mut cursor)?;
            let bsi = Bsi::read_from(&mut cursor)?;
            ints.insert(name, bsi);
        }

        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest)?;
        if !rest.is_empty() {
            return Err(EngineError::InvalidFormat(format!(
                "{} trailing bytes after index",
                rest.len()
            )));
        }

        Ok(Self {
            row_count: header.row_count,
            text,
            ints,
        })
    }
}
