//! Evidence and confidence scoring.
//!
//! ```text
//! confidence = Σ wᵢ·sᵢ / Σ wᵢ      over components with a non-zero weight and available inputs
//!   coverage     = contributing_rows / total_rows
//!   completeness = 1 - null_ratio(supporting fields)
//!   recency      = 0.5 ^ (age_of_newest_row / half_life)
//! ```
//!
//! Zero contributing rows is reported as [`QueryOutcome::NoResult`] without a
//! confidence, never as a result with confidence 0.

use crate::query::registry::{ConfidenceRule, Support};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryOutcome {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    NoResult,
}

impl QueryOutcome {
    pub fn is_no_result(&self) -> bool {
        matches!(self, QueryOutcome::NoResult)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub query: String,
    pub dataset_id: String,
    pub view: String,
    #[serde(rename = "result")]
    pub outcome: QueryOutcome,
    /// Literal statement executed, with bound values expanded.
    pub sql: String,
    pub evidence: String,
    pub samples: Vec<Map<String, Value>>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub oldest: DateTime<Utc>,
    pub newest: DateTime<Utc>,
}

/// Statistics gathered from the snapshot that produced the answer.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringInputs {
    pub total_rows: u64,
    pub contributing_rows: u64,
    /// Mean null ratio over the supporting fields; `None` when there are none.
    pub null_ratio: Option<f64>,
    pub time_range: Option<TimeRange>,
    pub now: DateTime<Utc>,
}

/// Number of rows backing the output, per the query's support rule.
pub fn contributing_rows(support: Support, columns: &[String], rows: &[Vec<Value>]) -> u64 {
    let column_index = |name: &str| columns.iter().position(|c| c == name);
    match support {
        Support::RowCount => rows.len() as u64,
        Support::CountColumn(name) => column_index(name)
            .and_then(|i| rows.first().and_then(|r| r.get(i)))
            .map(as_count)
            .unwrap_or(0),
        Support::SumColumn(name) => match column_index(name) {
            Some(i) => rows.iter().filter_map(|r| r.get(i)).map(as_count).sum(),
            None => 0,
        },
    }
}

fn as_count(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f > 0.0).map(|f| f as u64))
            .unwrap_or(0),
        _ => 0,
    }
}

pub fn coverage(inputs: &ScoringInputs) -> Option<f64> {
    if inputs.total_rows == 0 {
        return None;
    }
    Some(inputs.contributing_rows as f64 / inputs.total_rows as f64)
}

pub fn completeness(inputs: &ScoringInputs) -> Option<f64> {
    inputs.null_ratio.map(|r| 1.0 - r)
}

pub fn recency(inputs: &ScoringInputs, half_life_secs: Option<u64>) -> Option<f64> {
    let half_life = half_life_secs.filter(|h| *h > 0)? as f64;
    let newest = inputs.time_range?.newest;
    let age = (inputs.now - newest).num_milliseconds().max(0) as f64 / 1000.0;
    Some(0.5f64.powf(age / half_life))
}

/// Weighted confidence in `[0, 1]`, or `None` when no weighted component has inputs.
pub fn confidence(rule: &ConfidenceRule, inputs: &ScoringInputs) -> Option<f64> {
    let w = rule.weights;
    let components = [
        (w.coverage, coverage(inputs)),
        (w.completeness, completeness(inputs)),
        (w.recency, recency(inputs, rule.half_life_secs)),
    ];
    let (mut num, mut den) = (0.0, 0.0);
    for (weight, score) in components {
        if weight <= 0.0 {
            continue;
        }
        if let Some(score) = score {
            num += weight * score.clamp(0.0, 1.0);
            den += weight;
        }
    }
    if den == 0.0 {
        return None;
    }
    Some((num / den).clamp(0.0, 1.0))
}

/// Human-readable account of what backs an answer.
pub fn evidence_text(dataset_id: &str, view: &str, inputs: &ScoringInputs) -> String {
    let mut text = format!(
        "{} of {} rows contributed (dataset '{}', view '{}')",
        inputs.contributing_rows, inputs.total_rows, dataset_id, view
    );
    if let Some(ratio) = inputs.null_ratio {
        text.push_str(&format!("; supporting fields {:.1}% null", ratio * 100.0));
    }
    if let Some(range) = inputs.time_range {
        text.push_str(&format!(
            "; covering {} to {}",
            range.oldest.to_rfc3339(),
            range.newest.to_rfc3339()
        ));
    }
    text
}
