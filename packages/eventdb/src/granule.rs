//! Persistent granule store.
//!
//! A granule is one compacted part written durably as two blobs:
//!
//! ```text
//! {resource}/{id}        serialized FullIndex (see index::format)
//! {resource}/{id}/data   Arrow IPC file; string columns stored as plain Utf8
//! ```
//!
//! Both blobs go through one `commit_split` call. A granule only becomes
//! reachable once the primary index registers it, so a failed or partial
//! write leaves nothing a reader can find. Ids are never reused.

use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arrow_array::builder::StringDictionaryBuilder;
use arrow_array::cast::AsArray;
use arrow_array::types::Int32Type;
use arrow_array::{ArrayRef, RecordBatch};
use arrow_ipc::reader::FileReader;
use arrow_ipc::writer::FileWriter;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use arrow_select::concat::concat_batches;
use arrow_select::take::take;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::StorageConfig;
use crate::error::{EngineError, Result};
use crate::index::FullIndex;
use crate::part::Part;
use crate::schema::{ColumnKind, SchemaDescriptor};
use crate::storage::{commit_split, BlobStore};

/// Metadata for one persisted part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Granule {
    pub id: String,
    pub min: i64,
    pub max: i64,
    /// Durable bytes (index blob + data blob)
    pub size: u64,
    pub rows: u64,
}

impl Granule {
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.min <= end && start <= self.max
    }
}

pub fn index_key(resource: &str, id: &str) -> String {
    format!("{}/{}", resource, id)
}

pub fn data_key(resource: &str, id: &str) -> String {
    format!("{}/{}/data", resource, id)
}

static GRANULE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Fresh granule id: 32 hex chars of blake3 over the part's identity, the
/// wall clock and a process-wide counter.
fn new_granule_id(resource: &str, part: &Part) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let counter = GRANULE_COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut hasher = blake3::Hasher::new();
    hasher.update(resource.as_bytes());
    hasher.update(&part.min().to_le_bytes());
    hasher.update(&part.max().to_le_bytes());
    hasher.update(&(part.rows() as u64).to_le_bytes());
    hasher.update(&nanos.to_le_bytes());
    hasher.update(&counter.to_le_bytes());
    hasher.finalize().to_hex().as_str()[..32].to_string()
}

pub struct GranuleStore {
    store: Arc<dyn BlobStore>,
    config: StorageConfig,
}

impl GranuleStore {
    pub fn new(store: Arc<dyn BlobStore>, config: StorageConfig) -> Self {
        Self { store, config }
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Write `part` durably and return its metadata.
    pub fn persist(&self, resource: &str, part: &Part) -> Result<Granule> {
        let id = new_granule_id(resource, part);
        let index = part.index().to_bytes()?;
        let data = encode_batch(part.batch())?;
        let size = (index.len() + data.len()) as u64;

        let transactions = commit_split(
            self.store.as_ref(),
            vec![
                (index_key(resource, &id), index),
                (data_key(resource, &id), data),
            ],
            &self.config,
        )?;

        info!(
            resource,
            granule = %id,
            rows = part.rows(),
            bytes = size,
            transactions,
            "Persisted granule"
        );

        Ok(Granule {
            id,
            min: part.min(),
            max: part.max(),
            size,
            rows: part.rows() as u64,
        })
    }

    /// Read a granule back as a queryable part. Any decode failure is
    /// reported as `Corrupt` naming the offending key.
    pub fn load(&self, resource: &str, id: &str, schema: &SchemaDescriptor) -> Result<Part> {
        let ikey = index_key(resource, id);
        let dkey = data_key(resource, id);

        let index_bytes = self
            .store
            .get(&ikey)?
            .ok_or_else(|| EngineError::corrupt(&ikey, "missing index blob"))?;
        let index = FullIndex::from_bytes(&index_bytes).map_err(|e| EngineError::corrupt(&ikey, e))?;

        let data = self
            .store
            .get(&dkey)?
            .ok_or_else(|| EngineError::corrupt(&dkey, "missing data blob"))?;
        let batch = decode_batch(data, schema).map_err(|e| EngineError::corrupt(&dkey, e))?;

        Part::from_persisted(batch, index, schema).map_err(|e| EngineError::corrupt(&dkey, e))
    }
}

/// Arrow schema of the data blob: dictionary columns become plain Utf8.
fn durable_schema(schema: &SchemaRef) -> SchemaRef {
    let fields: Vec<Field> = schema
        .fields()
        .iter()
        .map(|f| match f.data_type() {
            DataType::Dictionary(_, value) => {
                Field::new(f.name(), value.as_ref().clone(), f.is_nullable())
            }
            other => Field::new(f.name(), other.clone(), f.is_nullable()),
        })
        .collect();
    Arc::new(Schema::new(fields))
}

fn encode_batch(batch: &RecordBatch) -> Result<Vec<u8>> {
    let schema = durable_schema(&batch.schema());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(batch.num_columns());
    for column in batch.columns() {
        match column.as_dictionary_opt::<Int32Type>() {
            Some(dict) => columns.push(take(dict.values().as_ref(), dict.keys(), None)?),
            None => columns.push(column.clone()),
        }
    }
    let plain = RecordBatch::try_new(schema.clone(), columns)?;

    let mut writer = FileWriter::try_new(Vec::new(), &schema)?;
    writer.write(&plain)?;
    writer.finish()?;
    Ok(writer.into_inner()?)
}

fn decode_batch(data: Vec<u8>, schema: &SchemaDescriptor) -> Result<RecordBatch> {
    let expected = durable_schema(schema.arrow());
    let reader = FileReader::try_new(Cursor::new(data), None)?;
    if reader.schema().fields() != expected.fields() {
        return Err(EngineError::SchemaMismatch(format!(
            "data blob schema {:?} does not match {:?}",
            reader.schema(),
            expected
        )));
    }
    let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
    let plain = concat_batches(&expected, &batches)?;

    let mut columns: Vec<ArrayRef> = Vec::with_capacity(plain.num_columns());
    for (field, column) in schema.fields().iter().zip(plain.columns()) {
        if field.kind != ColumnKind::Text {
            columns.push(column.clone());
            continue;
        }
        let strings = column.as_string::<i32>();
        let mut builder = StringDictionaryBuilder::<Int32Type>::new();
        for value in strings.iter() {
            match value {
                Some(v) => {
                    builder.append(v)?;
                }
                None => builder.append_null(),
            }
        }
        columns.push(Arc::new(builder.finish()));
    }
    Ok(RecordBatch::try_new(schema.arrow().clone(), columns)?)
}
