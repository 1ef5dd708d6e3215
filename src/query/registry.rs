//! Canned query registry.
//!
//! A fixed table of named, parameterized queries built once per process. Each
//! entry declares its SQL template, its parameters, how evidence is gathered
//! and how (or whether) its answers are scored.
//!
//! Templates use two kinds of placeholder:
//!
//! - `{view}` and `{field:<param>}` are identifiers. They are replaced with quoted
//!   names that were checked against the snapshot schema.
//! - `:name` is a value. It is bound as a typed SQLite parameter, never spliced.

use crate::core::error::NexusError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    /// Bound as TEXT.
    Text,
    /// Bound as INTEGER; accepts JSON numbers or decimal strings.
    Integer,
    /// Names a column of the view; substituted as a quoted identifier.
    Column,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub description: &'static str,
    /// Used when the caller omits the parameter. A parameter without a default is required.
    pub default: Option<&'static str>,
}

impl ParamSpec {
    pub fn required(&self) -> bool {
        self.default.is_none()
    }
}

/// Where the number of contributing rows comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "column", rename_all = "snake_case")]
pub enum Support {
    /// Number of rows returned.
    RowCount,
    /// Value of a column in the first returned row.
    CountColumn(&'static str),
    /// Sum of a column over all returned rows.
    SumColumn(&'static str),
}

/// A field whose completeness backs an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum FieldRef {
    Named(&'static str),
    /// The column named by a `Column` parameter.
    Param(&'static str),
}

#[derive(Debug, Clone, Serialize)]
pub struct EvidenceRule {
    pub support: Support,
    pub supporting_fields: &'static [FieldRef],
    /// Field holding event timestamps; enables time range and recency.
    pub time_field: Option<&'static str>,
    /// Condition selecting the contributing rows, with the template's
    /// placeholders. The time range covers only these rows; `None` means all.
    pub scope: Option<&'static str>,
    /// Number of sample records attached to the answer.
    pub sample_limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConfidenceWeights {
    pub coverage: f64,
    pub completeness: f64,
    pub recency: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfidenceRule {
    pub weights: ConfidenceWeights,
    /// Age at which the recency component halves.
    pub half_life_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CannedQuery {
    pub name: &'static str,
    pub description: &'static str,
    pub template: &'static str,
    pub params: &'static [ParamSpec],
    /// Columns the template reads directly; checked before execution.
    pub required_columns: &'static [&'static str],
    pub evidence: EvidenceRule,
    pub confidence: Option<ConfidenceRule>,
}

impl CannedQuery {
    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }
}

const DAY_SECS: u64 = 24 * 60 * 60;

static BUILTIN: &[CannedQuery] = &[
    CannedQuery {
        name: "total_requests",
        description: "Total number of records in the view",
        template: "SELECT COUNT(*) AS total FROM {view}",
        params: &[],
        required_columns: &[],
        evidence: EvidenceRule {
            support: Support::CountColumn("total"),
            supporting_fields: &[],
            time_field: None,
            scope: None,
            sample_limit: 5,
        },
        confidence: Some(ConfidenceRule {
            weights: ConfidenceWeights {
                coverage: 1.0,
                completeness: 0.0,
                recency: 0.0,
            },
            half_life_secs: None,
        }),
    },
    CannedQuery {
        name: "requests_since",
        description: "Number of records whose timestamp is at or after `since`",
        template: "SELECT COUNT(*) AS total FROM {view} WHERE \"timestamp\" >= :since",
        params: &[ParamSpec {
            name: "since",
            kind: ParamKind::Text,
            description: "lower bound, compared with the `timestamp` field",
            default: None,
        }],
        required_columns: &["timestamp"],
        evidence: EvidenceRule {
            support: Support::CountColumn("total"),
            supporting_fields: &[FieldRef::Named("timestamp")],
            time_field: Some("timestamp"),
            scope: Some("\"timestamp\" >= :since"),
            sample_limit: 5,
        },
        confidence: Some(ConfidenceRule {
            weights: ConfidenceWeights {
                coverage: 0.6,
                completeness: 0.0,
                recency: 0.4,
            },
            half_life_secs: Some(7 * DAY_SECS),
        }),
    },
    CannedQuery {
        name: "top_values",
        description: "Most frequent non-null values of a field",
        template: "SELECT {field:field} AS value, COUNT(*) AS hits FROM {view} \
                   WHERE {field:field} IS NOT NULL \
                   GROUP BY {field:field} ORDER BY hits DESC, value LIMIT :limit",
        params: &[
            ParamSpec {
                name: "field",
                kind: ParamKind::Column,
                description: "field to group by",
                default: None,
            },
            ParamSpec {
                name: "limit",
                kind: ParamKind::Integer,
                description: "maximum number of values",
                default: Some("10"),
            },
        ],
        required_columns: &[],
        evidence: EvidenceRule {
            support: Support::SumColumn("hits"),
            supporting_fields: &[FieldRef::Param("field")],
            time_field: None,
            scope: None,
            sample_limit: 5,
        },
        confidence: Some(ConfidenceRule {
            weights: ConfidenceWeights {
                coverage: 0.7,
                completeness: 0.3,
                recency: 0.0,
            },
            half_life_secs: None,
        }),
    },
    CannedQuery {
        name: "status_breakdown",
        description: "Record count per `status` value",
        template: "SELECT \"status\" AS status, COUNT(*) AS hits FROM {view} \
                   WHERE \"status\" IS NOT NULL \
                   GROUP BY \"status\" ORDER BY hits DESC, status",
        params: &[],
        required_columns: &["status"],
        evidence: EvidenceRule {
            support: Support::SumColumn("hits"),
            supporting_fields: &[FieldRef::Named("status")],
            time_field: None,
            scope: None,
            sample_limit: 5,
        },
        confidence: Some(ConfidenceRule {
            weights: ConfidenceWeights {
                coverage: 0.5,
                completeness: 0.5,
                recency: 0.0,
            },
            half_life_secs: None,
        }),
    },
    CannedQuery {
        name: "sample_records",
        description: "First records of the view in ingestion order",
        template: "SELECT * FROM {view} ORDER BY rowid LIMIT :limit",
        params: &[ParamSpec {
            name: "limit",
            kind: ParamKind::Integer,
            description: "number of records",
            default: Some("5"),
        }],
        required_columns: &[],
        evidence: EvidenceRule {
            support: Support::RowCount,
            supporting_fields: &[],
            time_field: None,
            scope: None,
            sample_limit: 0,
        },
        confidence: None,
    },
];

#[derive(Debug)]
pub struct CannedQueryRegistry {
    queries: BTreeMap<&'static str, CannedQuery>,
}

impl CannedQueryRegistry {
    /// The built-in query set.
    pub fn builtin() -> Self {
        Self {
            queries: BUILTIN.iter().map(|q| (q.name, q.clone())).collect(),
        }
    }

    /// Process-wide registry, built on first use and never mutated.
    pub fn global() -> &'static CannedQueryRegistry {
        static REGISTRY: OnceLock<CannedQueryRegistry> = OnceLock::new();
        REGISTRY.get_or_init(Self::builtin)
    }

    pub fn from_queries(queries: Vec<CannedQuery>) -> Result<Self, NexusError> {
        let mut map = BTreeMap::new();
        for query in queries {
            validate_template(&query)?;
            if map.insert(query.name, query).is_some() {
                return Err(NexusError::ValidationError(
                    "duplicate canned query name".to_string(),
                ));
            }
        }
        Ok(Self { queries: map })
    }

    pub fn lookup(&self, name: &str) -> Result<&CannedQuery, NexusError> {
        self.queries
            .get(name)
            .ok_or_else(|| NexusError::UnknownQuery(name.to_string()))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.queries.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CannedQuery> {
        self.queries.values()
    }
}

/// Identifier placeholders in `template`, in order of appearance: `None` for
/// `{view}`, `Some(param)` for `{field:param}`.
pub fn placeholders(template: &str) -> Result<Vec<Option<&str>>, String> {
    let mut out = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| "unterminated placeholder".to_string())?;
        let inner = &after[..end];
        match inner.split_once(':') {
            None if inner == "view" => out.push(None),
            Some(("field", param)) if !param.is_empty() => out.push(Some(param)),
            _ => return Err(format!("unsupported placeholder {{{inner}}}")),
        }
        rest = &after[end + 1..];
    }
    Ok(out)
}

/// Value placeholders (`:name`) in `sql`, in order of appearance.
pub fn value_placeholders(sql: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = sql;
    while let Some(pos) = rest.find(':') {
        let after = &rest[pos + 1..];
        let len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        if len > 0 {
            out.push(&after[..len]);
        }
        rest = &after[len..];
    }
    out
}

fn validate_template(query: &CannedQuery) -> Result<(), NexusError> {
    let invalid = |reason: String| {
        NexusError::ValidationError(format!("canned query '{}': {}", query.name, reason))
    };
    for param in placeholders(query.template).map_err(invalid)?.into_iter().flatten() {
        match query.param(param) {
            Some(spec) if spec.kind == ParamKind::Column => {}
            _ => return Err(invalid(format!("{{field:{param}}} needs a column parameter"))),
        }
    }
    if let Some(scope) = query.evidence.scope {
        for param in placeholders(scope).map_err(invalid)?.into_iter().flatten() {
            if query.param(param).map(|p| p.kind) != Some(ParamKind::Column) {
                return Err(invalid(format!("scope {{field:{param}}} needs a column parameter")));
            }
        }
        for name in value_placeholders(scope) {
            if query.param(name).is_none() {
                return Err(invalid(format!("scope binds undeclared parameter ':{name}'")));
            }
        }
    }
    for field in query.evidence.supporting_fields {
        if let FieldRef::Param(param) = field {
            if query.param(param).map(|p| p.kind) != Some(ParamKind::Column) {
                return Err(invalid(format!("supporting field refers to unknown parameter '{param}'")));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_set_is_complete_and_valid() {
        let registry = CannedQueryRegistry::builtin();
        assert_eq!(
            registry.names(),
            vec![
                "requests_since",
                "sample_records",
                "status_breakdown",
                "top_values",
                "total_requests"
            ]
        );
        for query in BUILTIN {
            validate_template(query).unwrap();
        }
    }

    #[test]
    fn unknown_name_fails_lookup() {
        let err = CannedQueryRegistry::global().lookup("bogus_query").unwrap_err();
        assert!(matches!(err, NexusError::UnknownQuery(ref n) if n == "bogus_query"));
    }

    #[test]
    fn placeholders_are_parsed_in_order() {
        assert_eq!(
            placeholders("SELECT {field:f} FROM {view} WHERE {field:g} > :x").unwrap(),
            vec![Some("f"), None, Some("g")]
        );
        assert!(placeholders("SELECT {oops} FROM {view}").is_err());
        assert!(placeholders("SELECT {view").is_err());
    }

    #[test]
    fn column_placeholder_must_reference_column_param() {
        let mut bad = BUILTIN[0].clone();
        bad.template = "SELECT {field:missing} FROM {view}";
        assert!(matches!(
            CannedQueryRegistry::from_queries(vec![bad]),
            Err(NexusError::ValidationError(_))
        ));
    }

    #[test]
    fn scope_may_only_bind_declared_params() {
        let mut bad = CannedQueryRegistry::global()
            .lookup("requests_since")
            .unwrap()
            .clone();
        bad.evidence.scope = Some("\"timestamp\" >= :until");
        let err = CannedQueryRegistry::from_queries(vec![bad]).unwrap_err();
        assert!(err.to_string().contains(":until"), "{err}");
        assert_eq!(
            value_placeholders("a >= :since AND b < :until_2"),
            vec!["since", "until_2"]
        );
    }

    #[test]
    fn sample_records_is_unscored() {
        let q = CannedQueryRegistry::global().lookup("sample_records").unwrap();
        assert!(q.confidence.is_none());
        assert!(!q.param("limit").unwrap().required());
    }
}
