//! Row-at-a-time construction of time-sorted event batches.
//!
//! Upstream collaborators hand over already-validated rows; this turns them
//! into the columnar, dictionary-coded, timestamp-sorted `RecordBatch` that
//! the indexer and the part tree expect.

use std::sync::Arc;

use arrow_array::builder::{
    BooleanBuilder, Float64Builder, Int64Builder, StringDictionaryBuilder,
};
use arrow_array::types::Int32Type;
use arrow_array::{ArrayRef, RecordBatch};

use crate::error::{EngineError, Result};
use crate::merge::sort_by_timestamp;
use crate::schema::{ColumnKind, SchemaDescriptor};

/// One cell of an incoming row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

enum ColumnBuilder {
    Int(Int64Builder),
    Float(Float64Builder),
    Bool(BooleanBuilder),
    Text(StringDictionaryBuilder<Int32Type>),
}

impl ColumnBuilder {
    fn new(kind: ColumnKind) -> Self {
        match kind {
            ColumnKind::Timestamp | ColumnKind::Int64 => ColumnBuilder::Int(Int64Builder::new()),
            ColumnKind::Float64 => ColumnBuilder::Float(Float64Builder::new()),
            ColumnKind::Boolean => ColumnBuilder::Bool(BooleanBuilder::new()),
            ColumnKind::Text => ColumnBuilder::Text(StringDictionaryBuilder::new()),
        }
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            ColumnBuilder::Int(b) => Arc::new(b.finish()),
            ColumnBuilder::Float(b) => Arc::new(b.finish()),
            ColumnBuilder::Bool(b) => Arc::new(b.finish()),
            ColumnBuilder::Text(b) => Arc::new(b.finish()),
        }
    }
}

/// Accumulates rows for one schema and emits a sorted batch.
pub struct BatchBuilder {
    schema: SchemaDescriptor,
    columns: Vec<ColumnBuilder>,
    rows: usize,
}

impl BatchBuilder {
    pub fn new(schema: &SchemaDescriptor) -> Self {
        let columns = schema
            .fields()
            .iter()
            .map(|f| ColumnBuilder::new(f.kind))
            .collect();
        Self {
            schema: schema.clone(),
            columns,
            rows: 0,
        }
    }

    /// Append one row. Values are positional, in schema order.
    ///
    /// The row is validated in full before any column is touched, so a
    /// rejected row leaves the builder unchanged.
    pub fn append_row(&mut self, row: Vec<Value>) -> Result<()> {
        let fields = self.schema.fields();
        if row.len() != fields.len() {
            return Err(EngineError::SchemaMismatch(format!(
                "row has {} values, schema has {} columns",
                row.len(),
                fields.len()
            )));
        }
        for (field, value) in fields.iter().zip(&row) {
            let ok = match (field.kind, value) {
                (_, Value::Null) => field.nullable,
                (ColumnKind::Timestamp | ColumnKind::Int64, Value::Int(_)) => true,
                (ColumnKind::Float64, Value::Float(_) | Value::Int(_)) => true,
                (ColumnKind::Boolean, Value::Bool(_)) => true,
                (ColumnKind::Text, Value::Text(_)) => true,
                _ => false,
            };
            if !ok {
                return Err(EngineError::SchemaMismatch(format!(
                    "column '{}' ({:?}) cannot hold {:?}",
                    field.name, field.kind, value
                )));
            }
        }

        for (builder, value) in self.columns.iter_mut().zip(row) {
            match (builder, value) {
                (ColumnBuilder::Int(b), Value::Int(v)) => b.append_value(v),
                (ColumnBuilder::Int(b), _) => b.append_null(),
                (ColumnBuilder::Float(b), Value::Float(v)) => b.append_value(v),
                (ColumnBuilder::Float(b), Value::Int(v)) => b.append_value(v as f64),
                (ColumnBuilder::Float(b), _) => b.append_null(),
                (ColumnBuilder::Bool(b), Value::Bool(v)) => b.append_value(v),
                (ColumnBuilder::Bool(b), _) => b.append_null(),
                (ColumnBuilder::Text(b), Value::Text(v)) => {
                    b.append(v.as_str())?;
                }
                (ColumnBuilder::Text(b), _) => b.append_null(),
            }
        }
        self.rows += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Emit the batch, stable-sorted by timestamp, and reset the builder.
    pub fn finish(&mut self) -> Result<RecordBatch> {
        let columns: Vec<ArrayRef> = self.columns.iter_mut().map(ColumnBuilder::finish).collect();
        self.rows = 0;
        let batch = RecordBatch::try_new(self.schema.arrow().clone(), columns)?;
        sort_by_timestamp(&batch, self.schema.timestamp_index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::cast::AsArray;
    use arrow_array::types::Int64Type;
    use arrow_array::Array;
    use crate::schema::FieldDescriptor;

    fn schema() -> SchemaDescriptor {
        SchemaDescriptor::new(
            1,
            vec![
                FieldDescriptor::new("timestamp", ColumnKind::Timestamp, false),
                FieldDescriptor::new("domain", ColumnKind::Text, true),
                FieldDescriptor::new("view", ColumnKind::Boolean, true),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_finish_sorts_stably() {
        let mut b = BatchBuilder::new(&schema());
        b.append_row(vec![Value::Int(30), "c".into(), true.into()]).unwrap();
        b.append_row(vec![Value::Int(10), "a".into(), Value::Null]).unwrap();
        b.append_row(vec![Value::Int(30), "d".into(), false.into()]).unwrap();
        assert_eq!(b.len(), 3);

        let batch = b.finish().unwrap();
        assert!(b.is_empty());
        let ts = batch.column(0).as_primitive::<Int64Type>();
        assert_eq!(ts.values().to_vec(), vec![10, 30, 30]);

        let domain = batch.column(1).as_dictionary::<Int32Type>();
        let values = domain.values().as_string::<i32>();
        let names: Vec<&str> = domain
            .keys()
            .iter()
            .map(|k| values.value(k.unwrap() as usize))
            .collect();
        // Ties keep ingestion order.
        assert_eq!(names, vec!["a", "c", "d"]);
        assert!(batch.column(2).is_null(0));
    }

    #[test]
    fn test_rejects_bad_row_without_side_effects() {
        let mut b = BatchBuilder::new(&schema());
        let err = b
            .append_row(vec![Value::Null, "a".into(), true.into()])
            .unwrap_err();
        assert!(err.to_string().contains("timestamp"), "{}", err);
        assert!(b.append_row(vec![Value::Int(1)]).is_err());
        assert!(b
            .append_row(vec![Value::Int(1), Value::Int(2), true.into()])
            .is_err());
        assert!(b.is_empty());
        assert_eq!(b.finish().unwrap().num_rows(), 0);
    }
}
