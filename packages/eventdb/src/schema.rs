//! Explicit, versioned schema descriptor for event batches.
//!
//! Built once at startup and shared by handle. Converts to an Arrow schema
//! exactly once; string columns are always `Dictionary(Int32, Utf8)`.

use std::collections::HashSet;
use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema, SchemaRef};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Logical column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    /// Event time, epoch milliseconds. Exactly one per schema, never null.
    Timestamp,
    /// Dictionary-coded string attribute.
    Text,
    Int64,
    Float64,
    Boolean,
}

impl ColumnKind {
    pub fn data_type(self) -> DataType {
        match self {
            ColumnKind::Timestamp | ColumnKind::Int64 => DataType::Int64,
            ColumnKind::Text => {
                DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8))
            }
            ColumnKind::Float64 => DataType::Float64,
            ColumnKind::Boolean => DataType::Boolean,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: ColumnKind,
    pub nullable: bool,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, kind: ColumnKind, nullable: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable,
        }
    }
}

/// Serialized form of [`SchemaDescriptor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SchemaFile {
    version: u32,
    fields: Vec<FieldDescriptor>,
}

/// Ordered list of `{name, kind, nullable}` plus a schema version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "SchemaFile", into = "SchemaFile")]
pub struct SchemaDescriptor {
    version: u32,
    fields: Vec<FieldDescriptor>,
    timestamp: usize,
    arrow: SchemaRef,
}

impl SchemaDescriptor {
    /// Validate and freeze a schema: unique names, exactly one non-null
    /// timestamp column.
    pub fn new(version: u32, fields: Vec<FieldDescriptor>) -> Result<Self> {
        let mut seen = HashSet::new();
        for f in &fields {
            if f.name.is_empty() {
                return Err(EngineError::InvalidSchema("empty column name".into()));
            }
            if !seen.insert(f.name.as_str()) {
                return Err(EngineError::InvalidSchema(format!(
                    "duplicate column '{}'",
                    f.name
                )));
            }
        }

        let timestamps: Vec<usize> = fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.kind == ColumnKind::Timestamp)
            .map(|(i, _)| i)
            .collect();
        let timestamp = match timestamps.as_slice() {
            [i] => *i,
            [] => return Err(EngineError::InvalidSchema("no timestamp column".into())),
            _ => {
                return Err(EngineError::InvalidSchema(
                    "more than one timestamp column".into(),
                ))
            }
        };
        if fields[timestamp].nullable {
            return Err(EngineError::InvalidSchema(
                "timestamp column must not be nullable".into(),
            ));
        }

        let arrow = Arc::new(Schema::new(
            fields
                .iter()
                .map(|f| Field::new(f.name.as_str(), f.kind.data_type(), f.nullable))
                .collect::<Vec<_>>(),
        ));

        Ok(Self {
            version,
            fields,
            timestamp,
            arrow,
        })
    }

    /// Default web-analytics event schema (version 1).
    pub fn events() -> Self {
        use ColumnKind::*;
        let mut fields = vec![
            FieldDescriptor::new("timestamp", Timestamp, false),
            FieldDescriptor::new("id", Int64, false),
            FieldDescriptor::new("bounce", Int64, true),
            FieldDescriptor::new("session", Boolean, true),
            FieldDescriptor::new("view", Boolean, true),
            FieldDescriptor::new("duration", Int64, true),
        ];
        for name in [
            "browser",
            "browser_version",
            "city",
            "country",
            "device",
            "domain",
            "entry_page",
            "event",
            "exit_page",
            "host",
            "os",
            "os_version",
            "page",
            "referrer",
            "source",
            "utm_campaign",
            "utm_content",
            "utm_medium",
            "utm_source",
            "utm_term",
        ] {
            fields.push(FieldDescriptor::new(name, Text, true));
        }
        match Self::new(1, fields) {
            Ok(schema) => schema,
            Err(e) => unreachable!("built-in event schema is valid: {}", e),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn arrow(&self) -> &SchemaRef {
        &self.arrow
    }

    /// Name of the timestamp column.
    pub fn timestamp(&self) -> &str {
        &self.fields[self.timestamp].name
    }

    pub fn timestamp_index(&self) -> usize {
        self.timestamp
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Resolve a projection to column positions; empty means every column.
    pub fn projection(&self, columns: &[String]) -> Result<Vec<usize>> {
        if columns.is_empty() {
            return Ok((0..self.fields.len()).collect());
        }
        columns
            .iter()
            .map(|c| {
                self.index_of(c)
                    .ok_or_else(|| EngineError::UnknownColumn(c.clone()))
            })
            .collect()
    }

    /// Check that an incoming Arrow schema matches names and types in order.
    pub fn check(&self, schema: &Schema) -> Result<()> {
        if schema.fields().len() != self.fields.len() {
            return Err(EngineError::SchemaMismatch(format!(
                "expected {} columns, got {}",
                self.fields.len(),
                schema.fields().len()
            )));
        }
        for (want, got) in self.arrow.fields().iter().zip(schema.fields()) {
            if want.name() != got.name() || want.data_type() != got.data_type() {
                return Err(EngineError::SchemaMismatch(format!(
                    "expected column {}: {}, got {}: {}",
                    want.name(),
                    want.data_type(),
                    got.name(),
                    got.data_type()
                )));
            }
        }
        Ok(())
    }
}

impl PartialEq for SchemaDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version && self.fields == other.fields
    }
}

impl TryFrom<SchemaFile> for SchemaDescriptor {
    type Error = EngineError;

    fn try_from(file: SchemaFile) -> Result<Self> {
        Self::new(file.version, file.fields)
    }
}

impl From<SchemaDescriptor> for SchemaFile {
    fn from(schema: SchemaDescriptor) -> Self {
        Self {
            version: schema.version,
            fields: schema.fields,
        }
    }
}
