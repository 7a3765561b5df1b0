//! eventdb - embeddable time-ordered analytics storage engine
//!
//! Events arrive as Arrow record batches per resource (e.g. a site domain),
//! are indexed on ingest and kept in a lock-free in-memory part tree.
//! Compaction merges parts and, once they are big or old enough, writes them
//! to a blob store as granules registered in a persisted primary index.
//!
//! # Layout
//!
//! - `schema`, `batch` -- column layout and row-wise batch construction
//! - `bsi`, `index` -- per-part bitmap indexes (text values, int64 BSI)
//! - `filter` -- compiled equality/regex/range predicates over the indexes
//! - `part`, `merge`, `tree` -- indexed parts and the in-memory part tree
//! - `storage`, `granule`, `primary` -- durable blobs, granules, primary index
//! - `engine` -- ties it together per resource, plus background compaction
//!
//! # Example
//!
//! ```no_run
//! use eventdb::{BatchBuilder, CancelToken, Engine, Filter, Filters, SchemaDescriptor, Value};
//!
//! let engine = Engine::in_memory(SchemaDescriptor::events()).unwrap();
//! let schema = engine.schema().clone();
//!
//! let mut rows = BatchBuilder::new(&schema);
//! let mut row = vec![Value::Null; schema.fields().len()];
//! row[0] = Value::Int(1_700_000_000_000);
//! row[1] = Value::Int(1);
//! row[schema.index_of("domain").unwrap()] = "example.com".into();
//! rows.append_row(row).unwrap();
//! engine.add("example.com", rows.finish().unwrap()).unwrap();
//!
//! let filters = Filters::compile(vec![Filter::eq("domain", "example.com")]).unwrap();
//! let out = engine
//!     .query("example.com", 0, i64::MAX, &filters, &[], &CancelToken::new())
//!     .unwrap();
//! assert_eq!(out.num_rows(), 1);
//! ```

pub mod batch;
pub mod bsi;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod granule;
pub mod index;
pub mod merge;
pub mod part;
pub mod primary;
pub mod schema;
pub mod storage;
pub mod tree;
pub mod tuning;

pub use batch::{BatchBuilder, Value};
pub use bsi::{Aggregate, Bsi, RangeOp};
pub use config::{CompactionConfig, EngineConfig, StorageConfig};
pub use engine::{Compactor, Engine};
pub use error::{EngineError, ErrorKind, Result};
pub use filter::{Filter, Filters, Op};
pub use granule::{Granule, GranuleStore};
pub use index::FullIndex;
pub use part::Part;
pub use primary::PrimaryIndex;
pub use schema::{ColumnKind, FieldDescriptor, SchemaDescriptor};
pub use storage::{BlobStore, FsStore, MemoryStore};
pub use tree::{CancelToken, CompactionResult, GranuleSink, Tree, TreeStats};
