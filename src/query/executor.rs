//! Query executor.
//!
//! `run_canned` resolves a registered query, checks and binds its parameters,
//! then materializes the view's committed snapshot and runs the statement, both
//! under one deadline of the configured timeout. The statement text SQLite actually ran, with bound values
//! expanded, is returned in the result and written to the audit log.

use crate::core::audit::{self, AuditEvent, AuditSink};
use crate::core::catalog::Catalog;
use crate::core::config::NexusConfig;
use crate::core::db::quote_ident;
use crate::core::error::NexusError;
use crate::core::time;
use crate::query::deadline::Deadline;
use crate::query::registry::{
    CannedQuery, CannedQueryRegistry, FieldRef, ParamKind, ParamSpec, placeholders,
};
use crate::query::scoring::{self, QueryOutcome, QueryResult, ScoringInputs, TimeRange};
use crate::query::snapshot::Snapshot;
use chrono::Utc;
use rusqlite::Statement;
use rusqlite::types::ValueRef;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

const RAW_QUERY_NAME: &str = "raw";

/// Caller-supplied parameter values, keyed by parameter name.
pub type QueryParams = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq)]
enum Bound {
    Text(String),
    Integer(i64),
    Column(String),
}

pub struct QueryExecutor<'a> {
    catalog: &'a Catalog,
    registry: &'a CannedQueryRegistry,
    audit: &'a dyn AuditSink,
    default_view: String,
    timeout: Duration,
}

impl<'a> QueryExecutor<'a> {
    pub fn new(
        catalog: &'a Catalog,
        registry: &'a CannedQueryRegistry,
        config: &NexusConfig,
        audit: &'a dyn AuditSink,
    ) -> Self {
        Self {
            catalog,
            registry,
            audit,
            default_view: config.default_view.clone(),
            timeout: config.query_timeout(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the canned query `name` against `view` (the configured default when `None`).
    ///
    /// An unknown name fails before anything is executed or audited.
    pub fn run_canned(
        &self,
        name: &str,
        params: &QueryParams,
        view: Option<&str>,
    ) -> Result<QueryResult, NexusError> {
        let query = self.registry.lookup(name)?;
        let view = view.unwrap_or(&self.default_view);
        let outcome = self.execute_canned(query, params, view);
        self.record(&format!("canned:{name}"), view, &outcome);
        outcome
    }

    /// Run one read-only SQL statement against the snapshot of `view`. The
    /// result is never scored.
    pub fn run_raw(&self, view: Option<&str>, sql: &str) -> Result<QueryResult, NexusError> {
        let view = view.unwrap_or(&self.default_view);
        let outcome = self.execute_raw(view, sql);
        self.record(RAW_QUERY_NAME, view, &outcome);
        outcome
    }

    fn execute_canned(
        &self,
        query: &CannedQuery,
        params: &QueryParams,
        view: &str,
    ) -> Result<QueryResult, NexusError> {
        let values = collect_params(query, params)?;
        let deadline = Deadline::start(query.name, self.timeout);
        let snapshot = Snapshot::open_within(self.catalog, view, &deadline)?;

        for column in query.required_columns {
            if snapshot.column_for(column).is_none() {
                return Err(NexusError::QueryFailed {
                    query: query.name.to_string(),
                    reason: format!("view '{view}' has no field '{column}'"),
                });
            }
        }

        let mut bound = BTreeMap::new();
        for (spec, value) in values {
            bound.insert(spec.name, bind_param(query, spec, &value, &snapshot)?);
        }
        let render_failed = |reason: String| NexusError::QueryFailed {
            query: query.name.to_string(),
            reason,
        };
        let sql = render(query.template, view, &bound).map_err(render_failed)?;

        let supporting: Vec<String> = query
            .evidence
            .supporting_fields
            .iter()
            .filter_map(|f| match f {
                FieldRef::Named(name) => snapshot.column_for(name).map(str::to_string),
                FieldRef::Param(param) => match bound.get(param) {
                    Some(Bound::Column(column)) => Some(column.clone()),
                    _ => None,
                },
            })
            .collect();
        let time_column = query
            .evidence
            .time_field
            .and_then(|f| snapshot.column_for(f))
            .map(str::to_string);
        let scope = match query.evidence.scope {
            Some(condition) => Some(render(condition, view, &bound).map_err(render_failed)?),
            None => None,
        };

        deadline.check()?;
        let conn = snapshot.connection();
        let watchdog = deadline.watch(conn.get_interrupt_handle());
        let run = (|| {
            let mut stmt = conn.prepare(&sql)?;
            bind_values(&mut stmt, &bound)?;
            let executed = stmt.expanded_sql().unwrap_or_else(|| sql.clone());
            let (columns, rows) = collect_rows(&mut stmt)?;
            drop(stmt);

            let null_ratio = null_ratio(&snapshot, &supporting)?;
            let time_range = match &time_column {
                Some(column) => time_range(&snapshot, column, scope.as_deref(), &bound)?,
                None => None,
            };
            let samples = sample_records(&snapshot, query.evidence.sample_limit)?;
            Ok::<_, rusqlite::Error>((executed, columns, rows, null_ratio, time_range, samples))
        })();
        let fired = watchdog.disarm();
        let (executed, columns, rows, null_ratio, time_range, samples) =
            run.map_err(|e| execution_error(&deadline, fired, e))?;

        let inputs = ScoringInputs {
            total_rows: snapshot.total_rows(),
            contributing_rows: scoring::contributing_rows(query.evidence.support, &columns, &rows),
            null_ratio,
            time_range,
            now: Utc::now(),
        };
        let entry = snapshot.entry();
        let evidence = scoring::evidence_text(&entry.dataset_id, view, &inputs);
        let (outcome, confidence) = if inputs.contributing_rows == 0 {
            (QueryOutcome::NoResult, None)
        } else {
            (
                QueryOutcome::Rows { columns, rows },
                query
                    .confidence
                    .as_ref()
                    .and_then(|rule| scoring::confidence(rule, &inputs)),
            )
        };

        tracing::info!(
            query = query.name,
            dataset_id = %entry.dataset_id,
            view,
            contributing = inputs.contributing_rows,
            total = inputs.total_rows,
            confidence = ?confidence,
            "canned query answered"
        );
        Ok(QueryResult {
            query: query.name.to_string(),
            dataset_id: entry.dataset_id.clone(),
            view: view.to_string(),
            outcome,
            sql: executed,
            evidence,
            samples,
            confidence,
        })
    }

    fn execute_raw(&self, view: &str, sql: &str) -> Result<QueryResult, NexusError> {
        let deadline = Deadline::start(RAW_QUERY_NAME, self.timeout);
        let snapshot = Snapshot::open_within(self.catalog, view, &deadline)?;
        let conn = snapshot.connection();
        let failed = |reason: String| NexusError::QueryFailed {
            query: RAW_QUERY_NAME.to_string(),
            reason,
        };

        let mut stmt = conn.prepare(sql).map_err(|e| failed(e.to_string()))?;
        if !stmt.readonly() {
            return Err(failed("only read-only statements are accepted".to_string()));
        }
        let executed = stmt.expanded_sql().unwrap_or_else(|| sql.to_string());

        deadline.check()?;
        let watchdog = deadline.watch(conn.get_interrupt_handle());
        let run = collect_rows(&mut stmt);
        let fired = watchdog.disarm();
        let (columns, rows) = run.map_err(|e| execution_error(&deadline, fired, e))?;

        let inputs = ScoringInputs {
            total_rows: snapshot.total_rows(),
            contributing_rows: rows.len() as u64,
            null_ratio: None,
            time_range: None,
            now: Utc::now(),
        };
        let entry = snapshot.entry();
        let evidence = scoring::evidence_text(&entry.dataset_id, view, &inputs);
        let outcome = if rows.is_empty() {
            QueryOutcome::NoResult
        } else {
            QueryOutcome::Rows { columns, rows }
        };
        Ok(QueryResult {
            query: RAW_QUERY_NAME.to_string(),
            dataset_id: entry.dataset_id.clone(),
            view: view.to_string(),
            outcome,
            sql: executed,
            evidence,
            samples: Vec::new(),
            confidence: None,
        })
    }

    fn record(&self, action: &str, view: &str, outcome: &Result<QueryResult, NexusError>) {
        let event = match outcome {
            Ok(result) => AuditEvent::new(
                "query",
                action,
                view,
                true,
                serde_json::json!({
                    "dataset_id": result.dataset_id,
                    "sql": result.sql,
                    "no_result": result.outcome.is_no_result(),
                    "confidence": result.confidence,
                }),
            ),
            Err(e) => AuditEvent::new(
                "query",
                action,
                view,
                false,
                serde_json::json!({
                    "error_kind": e.kind(),
                    "error": e.to_string(),
                }),
            ),
        };
        audit::emit_or_warn(self.audit, &event);
    }
}

fn execution_error(deadline: &Deadline, fired: bool, err: rusqlite::Error) -> NexusError {
    match deadline.classify(fired, err) {
        Err(timeout) => timeout,
        Ok(err) => NexusError::QueryFailed {
            query: deadline.query().to_string(),
            reason: err.to_string(),
        },
    }
}

/// Pair every declared parameter with its value or default. Unknown names and
/// missing required parameters fail here, before any snapshot is built.
fn collect_params<'q>(
    query: &'q CannedQuery,
    params: &QueryParams,
) -> Result<Vec<(&'q ParamSpec, Value)>, NexusError> {
    if let Some(extra) = params.keys().find(|k| query.param(k).is_none()) {
        return Err(NexusError::InvalidParameter {
            query: query.name.to_string(),
            param: extra.clone(),
            reason: "not declared by this query".to_string(),
        });
    }
    let mut out = Vec::with_capacity(query.params.len());
    for spec in query.params {
        let value = match (params.get(spec.name), spec.default) {
            (Some(v), _) if !v.is_null() => v.clone(),
            (_, Some(default)) => Value::String(default.to_string()),
            _ => {
                return Err(NexusError::MissingParameter {
                    query: query.name.to_string(),
                    param: spec.name.to_string(),
                });
            }
        };
        out.push((spec, value));
    }
    Ok(out)
}

fn bind_param(
    query: &CannedQuery,
    spec: &ParamSpec,
    value: &Value,
    snapshot: &Snapshot,
) -> Result<Bound, NexusError> {
    let invalid = |reason: String| NexusError::InvalidParameter {
        query: query.name.to_string(),
        param: spec.name.to_string(),
        reason,
    };
    match spec.kind {
        ParamKind::Text => match value {
            Value::String(s) => Ok(Bound::Text(s.clone())),
            Value::Number(n) => Ok(Bound::Text(n.to_string())),
            Value::Bool(b) => Ok(Bound::Text(b.to_string())),
            _ => Err(invalid("expected a scalar value".to_string())),
        },
        ParamKind::Integer => {
            let parsed = match value {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.trim().parse::<i64>().ok(),
                _ => None,
            };
            match parsed {
                Some(i) if i >= 0 => Ok(Bound::Integer(i)),
                Some(_) => Err(invalid("must be non-negative".to_string())),
                None => Err(invalid(format!("expected an integer, got {value}"))),
            }
        }
        ParamKind::Column => {
            let Value::String(name) = value else {
                return Err(invalid("expected a field name".to_string()));
            };
            snapshot
                .column_for(name)
                .map(|c| Bound::Column(c.to_string()))
                .ok_or_else(|| invalid(format!("view '{}' has no field '{}'", snapshot.view(), name)))
        }
    }
}

/// Substitute identifier placeholders with quoted names.
fn render(template: &str, view: &str, bound: &BTreeMap<&str, Bound>) -> Result<String, String> {
    let mut idents = placeholders(template)?.into_iter();
    let mut out = String::with_capacity(template.len() + 32);
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let end = rest[start..]
            .find('}')
            .ok_or_else(|| "unterminated placeholder".to_string())?;
        let ident = match idents.next().flatten() {
            None => quote_ident(view),
            Some(param) => match bound.get(param) {
                Some(Bound::Column(column)) => quote_ident(column),
                _ => return Err(format!("column parameter '{param}' is not bound")),
            },
        };
        out.push_str(&ident);
        rest = &rest[start + end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Bind every value parameter `stmt` mentions; parameters it does not use are skipped.
fn bind_values(stmt: &mut Statement<'_>, bound: &BTreeMap<&str, Bound>) -> Result<(), rusqlite::Error> {
    for (name, value) in bound {
        let Some(idx) = stmt.parameter_index(&format!(":{name}"))? else {
            continue;
        };
        match value {
            Bound::Text(s) => stmt.raw_bind_parameter(idx, s)?,
            Bound::Integer(i) => stmt.raw_bind_parameter(idx, i)?,
            Bound::Column(_) => {}
        }
    }
    Ok(())
}

type Rows = (Vec<String>, Vec<Vec<Value>>);

fn collect_rows(stmt: &mut Statement<'_>) -> Result<Rows, rusqlite::Error> {
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let width = columns.len();
    let mut rows = Vec::new();
    let mut cursor = stmt.raw_query();
    while let Some(row) = cursor.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(to_json(row.get_ref(i)?));
        }
        rows.push(values);
    }
    Ok((columns, rows))
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(b.iter().map(|x| format!("{x:02x}")).collect()),
    }
}

fn null_ratio(snapshot: &Snapshot, columns: &[String]) -> Result<Option<f64>, rusqlite::Error> {
    let total = snapshot.total_rows();
    if columns.is_empty() || total == 0 {
        return Ok(None);
    }
    let table = quote_ident(snapshot.view());
    let mut sum = 0.0;
    for column in columns {
        let nulls: i64 = snapshot.connection().query_row(
            &format!("SELECT COUNT(*) - COUNT({}) FROM {}", quote_ident(column), table),
            [],
            |row| row.get(0),
        )?;
        sum += nulls as f64 / total as f64;
    }
    Ok(Some(sum / columns.len() as f64))
}

/// Oldest and newest parseable timestamps in `column`, over the rows matching
/// `scope` when one is given.
fn time_range(
    snapshot: &Snapshot,
    column: &str,
    scope: Option<&str>,
    bound: &BTreeMap<&str, Bound>,
) -> Result<Option<TimeRange>, rusqlite::Error> {
    let mut sql = format!(
        "SELECT {col} FROM {table} WHERE {col} IS NOT NULL",
        col = quote_ident(column),
        table = quote_ident(snapshot.view())
    );
    if let Some(condition) = scope {
        sql.push_str(" AND (");
        sql.push_str(condition);
        sql.push(')');
    }
    let mut stmt = snapshot.connection().prepare(&sql)?;
    bind_values(&mut stmt, bound)?;
    let mut cursor = stmt.raw_query();
    let mut range: Option<TimeRange> = None;
    while let Some(row) = cursor.next()? {
        let parsed = match row.get_ref(0)? {
            ValueRef::Text(t) => time::parse_log_timestamp(&String::from_utf8_lossy(t)),
            ValueRef::Integer(i) => time::parse_log_timestamp(&i.to_string()),
            ValueRef::Real(f) => time::parse_log_timestamp(&(f as i64).to_string()),
            _ => None,
        };
        if let Some(ts) = parsed {
            range = Some(match range {
                Some(r) => TimeRange {
                    oldest: r.oldest.min(ts),
                    newest: r.newest.max(ts),
                },
                None => TimeRange {
                    oldest: ts,
                    newest: ts,
                },
            });
        }
    }
    Ok(range)
}

fn sample_records(
    snapshot: &Snapshot,
    limit: usize,
) -> Result<Vec<Map<String, Value>>, rusqlite::Error> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT * FROM {} ORDER BY rowid LIMIT {}",
        quote_ident(snapshot.view()),
        limit
    );
    let mut stmt = snapshot.connection().prepare(&sql)?;
    let (columns, rows) = collect_rows(&mut stmt)?;
    Ok(rows
        .into_iter()
        .map(|values| columns.iter().cloned().zip(values).collect())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{FieldType, FieldValue, Row, Schema};
    use crate::core::store::DataDir;
    use crate::ingest::writer::ChunkWriter;

    #[test]
    fn render_quotes_identifiers() {
        let mut bound = BTreeMap::new();
        bound.insert("field", Bound::Column("http.status".to_string()));
        let sql = render(
            "SELECT {field:field}, COUNT(*) FROM {view} GROUP BY {field:field}",
            "logs",
            &bound,
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT \"http.status\", COUNT(*) FROM \"logs\" GROUP BY \"http.status\""
        );
    }

    #[test]
    fn missing_required_param_is_reported_before_execution() {
        let query = CannedQueryRegistry::global().lookup("requests_since").unwrap();
        let err = collect_params(query, &QueryParams::new()).unwrap_err();
        assert!(matches!(
            err,
            NexusError::MissingParameter { ref param, .. } if param == "since"
        ));
    }

    #[test]
    fn defaults_fill_optional_params() {
        let query = CannedQueryRegistry::global().lookup("sample_records").unwrap();
        let values = collect_params(query, &QueryParams::new()).unwrap();
        assert_eq!(values[0].1, Value::String("5".to_string()));
    }

    #[test]
    fn undeclared_params_are_rejected() {
        let query = CannedQueryRegistry::global().lookup("total_requests").unwrap();
        let mut params = QueryParams::new();
        params.insert("limit".to_string(), Value::from(3));
        assert!(matches!(
            collect_params(query, &params),
            Err(NexusError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn interrupted_statements_become_timeouts_for_the_query() {
        let deadline = Deadline::start("top_values", Duration::from_millis(250));
        let err = execution_error(&deadline, true, rusqlite::Error::InvalidQuery);
        assert!(matches!(
            err,
            NexusError::QueryTimeout { ref query, timeout_ms: 250 } if query == "top_values"
        ));
        let err = execution_error(&deadline, false, rusqlite::Error::InvalidQuery);
        assert!(matches!(err, NexusError::QueryFailed { ref query, .. } if query == "top_values"));
    }

    #[test]
    fn time_range_is_limited_to_scoped_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&DataDir::new(tmp.path())).unwrap();
        let mut schema = Schema::new();
        schema.set("timestamp", FieldType::String);
        let mut w = ChunkWriter::new(catalog.data_dir(), "web", 0, 10).unwrap();
        let stamps = ["2024-05-01T10:00:00Z", "2024-05-01T12:00:00Z", "2024-05-01T13:00:00Z"];
        for (line, ts) in stamps.iter().enumerate() {
            let mut row = Row::default();
            row.insert("timestamp".to_string(), FieldValue::Str(ts.to_string()));
            w.push(line as u64 + 1, row, &schema).unwrap();
        }
        let chunks = w.finish(&schema).unwrap();
        catalog.commit("web", &chunks, &schema, Some("logs")).unwrap();
        let snapshot = Snapshot::open(&catalog, "logs").unwrap();

        let mut bound = BTreeMap::new();
        bound.insert("since", Bound::Text("2024-05-01T11:00:00Z".to_string()));
        let scoped = time_range(&snapshot, "timestamp", Some("\"timestamp\" >= :since"), &bound)
            .unwrap()
            .unwrap();
        assert_eq!(scoped.oldest.to_rfc3339(), "2024-05-01T12:00:00+00:00");
        assert_eq!(scoped.newest.to_rfc3339(), "2024-05-01T13:00:00+00:00");

        let whole = time_range(&snapshot, "timestamp", None, &bound).unwrap().unwrap();
        assert_eq!(whole.oldest.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }
}
