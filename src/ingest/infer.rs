//! Schema inference and coercion for decoded JSON records.
//!
//! Each value is typed on its own, then merged with the field's declared type:
//!
//! | declared \ observed | same | null | int/float | other scalar or nested |
//! |---|---|---|---|---|
//! | null | observed | null | observed | observed |
//! | integer / float | same | declared | float (or string, see [`NumericWidening`]) | string |
//! | boolean / string / nested | same | declared | string | string |
//!
//! `nested` only meets `nested` without widening. Objects are expanded into dotted
//! field names for [`MAX_NESTING_DEPTH`] levels; deeper objects and all arrays are
//! kept whole as canonical JSON text.

use crate::core::model::{FieldType, FieldValue, LINE_COLUMN, Row, Schema};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Object levels expanded into dotted names before the remainder is kept as JSON text.
pub const MAX_NESTING_DEPTH: usize = 2;

/// How an integer/float conflict resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumericWidening {
    #[default]
    Float,
    String,
}

/// A field whose declared type changed because of a conflicting value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaWarning {
    pub field: String,
    pub from: FieldType,
    pub to: FieldType,
    /// 1-based input line that triggered the change
    pub line: u64,
}

impl fmt::Display for SchemaWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "line {}: field '{}' widened from {} to {}",
            self.line, self.field, self.from, self.to
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaInferencer {
    numeric: NumericWidening,
}

impl SchemaInferencer {
    pub fn new(numeric: NumericWidening) -> Self {
        Self { numeric }
    }

    /// Merge a declared type with an observed one.
    pub fn widen(&self, declared: FieldType, observed: FieldType) -> FieldType {
        use FieldType::*;
        match (declared, observed) {
            (a, b) if a == b => a,
            (Null, t) | (t, Null) => t,
            (Integer, Float) | (Float, Integer) => match self.numeric {
                NumericWidening::Float => Float,
                NumericWidening::String => String,
            },
            _ => String,
        }
    }

    /// Type `record`, widen `schema` in place and return the row coerced to the
    /// widened schema. Conflicts that change a non-null declared type are
    /// appended to `warnings`.
    pub fn infer_record(
        &self,
        record: &Map<String, Value>,
        schema: &mut Schema,
        line: u64,
        warnings: &mut Vec<SchemaWarning>,
    ) -> Row {
        let mut cells = Vec::with_capacity(record.len());
        flatten("", record, 0, &mut cells);

        let mut row = Row::default();
        for (name, value) in cells {
            let observed = value.field_type();
            let merged = match schema.get(&name) {
                Some(declared) => {
                    let merged = self.widen(declared, observed);
                    if merged != declared {
                        if declared != FieldType::Null {
                            tracing::debug!(field = %name, from = %declared, to = %merged, line, "schema widened");
                            warnings.push(SchemaWarning {
                                field: name.clone(),
                                from: declared,
                                to: merged,
                                line,
                            });
                        }
                        schema.set(&name, merged);
                    }
                    merged
                }
                None => {
                    schema.set(&name, observed);
                    observed
                }
            };
            row.insert(name, value.coerce_to(merged));
        }
        row
    }
}

/// Type a single JSON value as a cell.
pub fn to_field_value(value: &Value) -> FieldValue {
    match value {
        Value::Null => FieldValue::Null,
        Value::Bool(b) => FieldValue::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => FieldValue::Int(i),
            None => FieldValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => FieldValue::Str(s.clone()),
        Value::Array(_) | Value::Object(_) => FieldValue::Nested(value.to_string()),
    }
}

fn flatten(prefix: &str, obj: &Map<String, Value>, depth: usize, out: &mut Vec<(String, FieldValue)>) {
    for (key, value) in obj {
        let name = if prefix.is_empty() {
            storage_safe_name(key)
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(inner) if depth < MAX_NESTING_DEPTH && !inner.is_empty() => {
                flatten(&name, inner, depth + 1, out)
            }
            other => out.push((name, to_field_value(other))),
        }
    }
}

/// Top-level keys may not shadow the reserved line column.
fn storage_safe_name(key: &str) -> String {
    if key == LINE_COLUMN {
        format!("{key}_")
    } else {
        key.to_string()
    }
}

/// Wrap a decoded non-object value so every record is an object.
pub fn as_record(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn widen_follows_lattice() {
        let inf = SchemaInferencer::default();
        assert_eq!(inf.widen(FieldType::Integer, FieldType::Float), FieldType::Float);
        assert_eq!(inf.widen(FieldType::Float, FieldType::Integer), FieldType::Float);
        assert_eq!(inf.widen(FieldType::Boolean, FieldType::String), FieldType::String);
        assert_eq!(inf.widen(FieldType::Integer, FieldType::Nested), FieldType::String);
        assert_eq!(inf.widen(FieldType::Nested, FieldType::Nested), FieldType::Nested);
        assert_eq!(inf.widen(FieldType::Null, FieldType::Boolean), FieldType::Boolean);
        assert_eq!(inf.widen(FieldType::Integer, FieldType::Null), FieldType::Integer);

        let strict = SchemaInferencer::new(NumericWidening::String);
        assert_eq!(strict.widen(FieldType::Integer, FieldType::Float), FieldType::String);
    }

    #[test]
    fn integer_then_string_then_float_ends_as_string() {
        let inf = SchemaInferencer::default();
        let mut schema = Schema::new();
        let mut warnings = Vec::new();

        inf.infer_record(&obj(json!({"a": 1})), &mut schema, 1, &mut warnings);
        let row = inf.infer_record(&obj(json!({"a": "x"})), &mut schema, 2, &mut warnings);
        assert_eq!(row["a"], FieldValue::Str("x".to_string()));
        let row = inf.infer_record(&obj(json!({"a": 2.5})), &mut schema, 3, &mut warnings);
        assert_eq!(row["a"], FieldValue::Str("2.5".to_string()));

        assert_eq!(schema.get("a"), Some(FieldType::String));
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].from, FieldType::Integer);
        assert_eq!(warnings[0].to, FieldType::String);
        assert_eq!(warnings[0].line, 2);
    }

    #[test]
    fn null_promotion_is_not_a_warning() {
        let inf = SchemaInferencer::default();
        let mut schema = Schema::new();
        let mut warnings = Vec::new();
        inf.infer_record(&obj(json!({"a": null})), &mut schema, 1, &mut warnings);
        assert_eq!(schema.get("a"), Some(FieldType::Null));
        inf.infer_record(&obj(json!({"a": true})), &mut schema, 2, &mut warnings);
        assert_eq!(schema.get("a"), Some(FieldType::Boolean));
        assert!(warnings.is_empty());
    }

    #[test]
    fn absent_fields_do_not_change_schema() {
        let inf = SchemaInferencer::default();
        let mut schema = Schema::new();
        let mut warnings = Vec::new();
        inf.infer_record(&obj(json!({"a": 1, "b": "x"})), &mut schema, 1, &mut warnings);
        let row = inf.infer_record(&obj(json!({"a": 2})), &mut schema, 2, &mut warnings);
        assert!(!row.contains_key("b"));
        assert_eq!(schema.get("b"), Some(FieldType::String));
        assert_eq!(schema.len(), 2);
    }

    #[test]
    fn objects_expand_up_to_depth_bound() {
        let inf = SchemaInferencer::default();
        let mut schema = Schema::new();
        let mut warnings = Vec::new();
        let row = inf.infer_record(
            &obj(json!({
                "http": {"status": 200, "req": {"method": "GET", "headers": {"ua": "curl"}}},
                "tags": ["a", "b"]
            })),
            &mut schema,
            1,
            &mut warnings,
        );
        assert_eq!(schema.get("http.status"), Some(FieldType::Integer));
        assert_eq!(schema.get("http.req.method"), Some(FieldType::String));
        assert_eq!(schema.get("http.req.headers"), Some(FieldType::Nested));
        assert_eq!(schema.get("tags"), Some(FieldType::Nested));
        assert_eq!(
            row["http.req.headers"],
            FieldValue::Nested(r#"{"ua":"curl"}"#.to_string())
        );
        assert_eq!(row["tags"], FieldValue::Nested(r#"["a","b"]"#.to_string()));
    }

    #[test]
    fn nested_against_scalar_widens_to_string() {
        let inf = SchemaInferencer::default();
        let mut schema = Schema::new();
        let mut warnings = Vec::new();
        inf.infer_record(&obj(json!({"x": [1, 2]})), &mut schema, 1, &mut warnings);
        let row = inf.infer_record(&obj(json!({"x": 7})), &mut schema, 2, &mut warnings);
        assert_eq!(schema.get("x"), Some(FieldType::String));
        assert_eq!(row["x"], FieldValue::Str("7".to_string()));
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn non_object_values_are_wrapped() {
        let record = as_record(json!(42));
        assert_eq!(record["value"], json!(42));
        let record = as_record(json!({"k": 1}));
        assert!(record.contains_key("k"));
    }

    #[test]
    fn reserved_line_key_is_renamed() {
        let inf = SchemaInferencer::default();
        let mut schema = Schema::new();
        let mut warnings = Vec::new();
        let row = inf.infer_record(&obj(json!({"_line": 9})), &mut schema, 1, &mut warnings);
        assert!(row.contains_key("_line_"));
        assert!(!schema.contains("_line"));
    }
}
