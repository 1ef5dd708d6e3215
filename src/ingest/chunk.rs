//! Parquet encoding of chunks.
//!
//! A chunk stores the `_line` column followed by every field of the schema that
//! was current when it was written. Reading a chunk back coerces each column to
//! a (possibly wider) target schema; fields added after the chunk read as null.

use crate::core::error::NexusError;
use crate::core::model::{FieldType, FieldValue, LINE_COLUMN, Row, Schema};
use arrow_array::cast::AsArray;
use arrow_array::types::{Float64Type, Int64Type, UInt64Type};
use arrow_array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray,
    UInt64Array,
};
use arrow_schema::{DataType, Field, SchemaRef};
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// A buffered row plus the input line it came from.
#[derive(Debug, Clone)]
pub struct LineRow {
    pub line: u64,
    pub row: Row,
}

pub fn arrow_type(field_type: FieldType) -> DataType {
    match field_type {
        FieldType::Boolean => DataType::Boolean,
        FieldType::Integer => DataType::Int64,
        FieldType::Float => DataType::Float64,
        // An all-null column is stored as nullable text so every chunk has a concrete type.
        FieldType::Null | FieldType::String | FieldType::Nested => DataType::Utf8,
    }
}

pub fn arrow_schema(schema: &Schema) -> SchemaRef {
    let mut fields = Vec::with_capacity(schema.len() + 1);
    fields.push(Field::new(LINE_COLUMN, DataType::UInt64, false));
    for f in schema.fields() {
        fields.push(Field::new(&f.name, arrow_type(f.field_type), true));
    }
    Arc::new(arrow_schema::Schema::new(fields))
}

/// Encode `rows` as one Parquet file, coercing every cell to `schema`.
pub fn encode_chunk(schema: &Schema, rows: &[LineRow]) -> Result<Vec<u8>, NexusError> {
    let arrow = arrow_schema(schema);
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.len() + 1);
    columns.push(Arc::new(UInt64Array::from(
        rows.iter().map(|r| r.line).collect::<Vec<u64>>(),
    )));

    for field in schema.fields() {
        let cells = rows.iter().map(|r| {
            r.row
                .get(&field.name)
                .map(|v| v.coerce_to(field.field_type))
                .unwrap_or(FieldValue::Null)
        });
        let column: ArrayRef = match field.field_type {
            FieldType::Boolean => Arc::new(BooleanArray::from(
                cells
                    .map(|v| match v {
                        FieldValue::Bool(b) => Some(b),
                        _ => None,
                    })
                    .collect::<Vec<Option<bool>>>(),
            )),
            FieldType::Integer => Arc::new(Int64Array::from(
                cells
                    .map(|v| match v {
                        FieldValue::Int(i) => Some(i),
                        _ => None,
                    })
                    .collect::<Vec<Option<i64>>>(),
            )),
            FieldType::Float => Arc::new(Float64Array::from(
                cells
                    .map(|v| match v {
                        FieldValue::Float(f) => Some(f),
                        _ => None,
                    })
                    .collect::<Vec<Option<f64>>>(),
            )),
            FieldType::Null | FieldType::String | FieldType::Nested => Arc::new(StringArray::from(
                cells
                    .map(|v| match v {
                        FieldValue::Str(s) | FieldValue::Nested(s) => Some(s),
                        _ => None,
                    })
                    .collect::<Vec<Option<String>>>(),
            )),
        };
        columns.push(column);
    }

    let batch = RecordBatch::try_new(arrow.clone(), columns)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, arrow, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(buf)
}

/// A decoded row: input line plus one value per field of the target schema.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRow {
    pub line: u64,
    pub values: Vec<FieldValue>,
}

/// Read a chunk file and coerce its rows to `target`.
pub fn decode_chunk(path: &Path, target: &Schema) -> Result<Vec<DecodedRow>, NexusError> {
    let file = File::open(path).map_err(NexusError::IoError)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut out = Vec::new();
    for batch in reader {
        let batch = batch?;
        let lines = batch.column_by_name(LINE_COLUMN).ok_or_else(|| {
            NexusError::ValidationError(format!(
                "chunk {} has no {} column",
                path.display(),
                LINE_COLUMN
            ))
        })?;
        let lines = lines.as_primitive::<UInt64Type>();
        let columns: Vec<Option<&ArrayRef>> = target
            .fields()
            .iter()
            .map(|f| batch.column_by_name(&f.name))
            .collect();

        for i in 0..batch.num_rows() {
            let values = target
                .fields()
                .iter()
                .zip(&columns)
                .map(|(field, column)| match column {
                    Some(array) => cell(array, i, field.field_type).coerce_to(field.field_type),
                    None => FieldValue::Null,
                })
                .collect();
            out.push(DecodedRow {
                line: lines.value(i),
                values,
            });
        }
    }
    Ok(out)
}

fn cell(array: &ArrayRef, i: usize, target: FieldType) -> FieldValue {
    if array.is_null(i) {
        return FieldValue::Null;
    }
    match array.data_type() {
        DataType::Boolean => FieldValue::Bool(array.as_boolean().value(i)),
        DataType::Int64 => FieldValue::Int(array.as_primitive::<Int64Type>().value(i)),
        DataType::Float64 => FieldValue::Float(array.as_primitive::<Float64Type>().value(i)),
        DataType::Utf8 => {
            let s = array.as_string::<i32>().value(i).to_string();
            if target == FieldType::Nested {
                FieldValue::Nested(s)
            } else {
                FieldValue::Str(s)
            }
        }
        _ => FieldValue::Null,
    }
}
