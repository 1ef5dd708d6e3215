//! Field types, schemas and typed values shared by ingestion, the catalog and queries.
//!
//! `FieldType` is a small lattice: `Null` sits at the bottom, `String` at the top.
//! A schema only ever moves up that lattice, never down.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the storage column carrying the 1-based input line of each row.
pub const LINE_COLUMN: &str = "_line";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Null,
    Boolean,
    Integer,
    Float,
    String,
    Nested,
}

impl FieldType {
    /// True when a column of type `self` may be redeclared as `to` without narrowing.
    pub fn can_widen_to(self, to: FieldType) -> bool {
        self == to
            || self == FieldType::Null
            || to == FieldType::String
            || (self == FieldType::Integer && to == FieldType::Float)
    }

    /// SQLite column affinity used when a dataset is materialized for querying.
    pub fn sql_affinity(self) -> &'static str {
        match self {
            FieldType::Null => "",
            FieldType::Boolean | FieldType::Integer => "INTEGER",
            FieldType::Float => "REAL",
            FieldType::String | FieldType::Nested => "TEXT",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldType::Null => "null",
            FieldType::Boolean => "boolean",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::String => "string",
            FieldType::Nested => "nested",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

/// Ordered field list. Order is first-seen order and is stable across ingests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<FieldType> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.field_type)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Declare `name` as `field_type`, appending it when new.
    pub fn set(&mut self, name: &str, field_type: FieldType) {
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(field) => field.field_type = field_type,
            None => self.fields.push(Field {
                name: name.to_string(),
                field_type,
            }),
        }
    }

    /// True when every field of `older` is still present here with an equal or wider type.
    pub fn is_widening_of(&self, older: &Schema) -> bool {
        older.fields.iter().all(|old| match self.get(&old.name) {
            Some(current) => old.field_type.can_widen_to(current),
            None => false,
        })
    }
}

/// One cell of a coerced record.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Canonical JSON text of an array or an object past the nesting bound.
    Nested(String),
}

/// A coerced record keyed by field name. Absent keys read as null.
pub type Row = FxHashMap<String, FieldValue>;

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Null => FieldType::Null,
            FieldValue::Bool(_) => FieldType::Boolean,
            FieldValue::Int(_) => FieldType::Integer,
            FieldValue::Float(_) => FieldType::Float,
            FieldValue::Str(_) => FieldType::String,
            FieldValue::Nested(_) => FieldType::Nested,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Canonical textual form, used whenever a value widens to `String`.
    pub fn canonical_text(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Bool(b) => Some(b.to_string()),
            FieldValue::Int(i) => Some(i.to_string()),
            FieldValue::Float(f) => Some(
                serde_json::Number::from_f64(*f)
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| f.to_string()),
            ),
            FieldValue::Str(s) | FieldValue::Nested(s) => Some(s.clone()),
        }
    }

    /// Convert to `target`. The target must be reachable from this value's type
    /// through the widening lattice; anything else reads as null.
    pub fn coerce_to(&self, target: FieldType) -> FieldValue {
        match (self, target) {
            (FieldValue::Null, _) => FieldValue::Null,
            (v, t) if v.field_type() == t => v.clone(),
            (FieldValue::Int(i), FieldType::Float) => FieldValue::Float(*i as f64),
            (v, FieldType::String) => v
                .canonical_text()
                .map(FieldValue::Str)
                .unwrap_or(FieldValue::Null),
            _ => FieldValue::Null,
        }
    }

    pub fn to_sql(&self) -> rusqlite::types::Value {
        use rusqlite::types::Value;
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Integer(i64::from(*b)),
            FieldValue::Int(i) => Value::Integer(*i),
            FieldValue::Float(f) => Value::Real(*f),
            FieldValue::Str(s) | FieldValue::Nested(s) => Value::Text(s.clone()),
        }
    }
}
