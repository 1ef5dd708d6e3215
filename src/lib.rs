//! lognexus: local-first log ingestion and canned analytics.
//!
//! **lognexus turns heterogeneous NDJSON logs into durable, schema-evolving
//! Parquet datasets and answers pre-declared questions about them.**
//!
//! Every answer carries the result, the exact statement executed, the evidence
//! behind it and a confidence score.
//!
//! # Architecture
//!
//! ## Ingestion
//!
//! - **Schema inference** (`ingest::infer`): per-field types merged through a widening lattice
//! - **Chunked writer** (`ingest::writer`): immutable `<seq>.parquet` chunks, written to a temporary file, fsynced, hard-linked into place (never over an existing chunk)
//! - **Job** (`ingest::job`): `Open -> Reading -> FinalFlush -> CatalogUpsert -> Closed`
//!
//! ## Catalog
//!
//! `core::catalog` is an explicit service over a SQLite file. Mutations run in
//! one IMMEDIATE transaction; reads run in one read transaction; each dataset has
//! a single writer at a time.
//!
//! ## Queries
//!
//! - **Registry** (`query::registry`): fixed table of named templates
//! - **Snapshot** (`query::snapshot`): the committed chunks of a view, loaded read-only in memory
//! - **Executor** (`query::executor`): typed binding, timeout, expanded SQL capture
//! - **Scoring** (`query::scoring`): coverage, completeness, recency
//!
//! # Layout
//!
//! ```text
//! <data_dir>/
//!   parquet/<dataset-id>/<seq>.parquet
//!   duckdb/catalog.db
//!   audit.log
//! ```
//!
//! # Examples
//!
//! ```bash
//! lognexus ingest access.jsonl --dataset web
//! lognexus query total_requests
//! lognexus query top_values -p field=status -p limit=5 --format json
//! lognexus raw 'SELECT COUNT(*) FROM logs WHERE status >= 500'
//! ```

pub mod cli;
pub mod core;
pub mod ingest;
pub mod query;

use crate::cli::{Cli, Command, OutputFormat};
use crate::core::audit::JsonlAuditSink;
use crate::core::catalog::{Catalog, CatalogEntry};
use crate::core::config::NexusConfig;
use crate::core::error::NexusError;
use crate::core::logging;
use crate::ingest::job::{IngestRequest, IngestSummary, Ingestor};
use crate::query::executor::{QueryExecutor, QueryParams};
use crate::query::registry::CannedQueryRegistry;
use crate::query::scoring::{QueryOutcome, QueryResult};
use clap::Parser;
use colored::Colorize;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufReader};

/// Process exit code when a query completed but had nothing to report.
pub const EXIT_NO_RESULT: i32 = 3;

/// Parse the command line, run one command and return the process exit code.
pub fn run() -> Result<i32, NexusError> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => NexusConfig::load(path)?,
        None => NexusConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    config.validate()?;
    logging::init(cli.debug, config.log_level.as_deref());

    let data_dir = config.data_dir();
    let catalog = Catalog::open(&data_dir)?;
    let audit = JsonlAuditSink::new(&data_dir.audit_log_path());
    tracing::debug!(data_dir = %data_dir.root.display(), "catalog opened");

    match cli.command {
        Command::Ingest {
            input,
            dataset,
            view,
            format,
        } => {
            let source_name = if input.as_os_str() == "-" {
                "stdin".to_string()
            } else {
                input.display().to_string()
            };
            let mut request = IngestRequest::new(&source_name);
            request.dataset_id = dataset;
            request.view = view;

            let ingestor = Ingestor::new(&catalog, &config, &audit);
            let summary = if input.as_os_str() == "-" {
                ingestor.ingest(io::stdin().lock(), request)?
            } else {
                let file = File::open(&input).map_err(|e| {
                    NexusError::NotFound(format!("{}: {}", input.display(), e))
                })?;
                ingestor.ingest(BufReader::new(file), request)?
            };
            emit(format, &summary, print_summary)?;
            Ok(0)
        }
        Command::Query {
            name,
            params,
            view,
            format,
        } => {
            let params = parse_params(&params)?;
            let executor =
                QueryExecutor::new(&catalog, CannedQueryRegistry::global(), &config, &audit);
            let result = executor.run_canned(&name, &params, view.as_deref())?;
            emit(format, &result, print_result)?;
            Ok(exit_code(&result))
        }
        Command::Raw { sql, view, format } => {
            let executor =
                QueryExecutor::new(&catalog, CannedQueryRegistry::global(), &config, &audit);
            let result = executor.run_raw(view.as_deref(), &sql)?;
            emit(format, &result, print_result)?;
            Ok(exit_code(&result))
        }
        Command::View { dataset, view } => {
            catalog.register_view(&dataset, &view)?;
            println!("{} view {} -> {}", "✓".bright_green(), view.bold(), dataset);
            Ok(0)
        }
        Command::Datasets { format } => {
            let entries = catalog.list()?;
            emit(format, &entries, |entries: &Vec<CatalogEntry>| {
                if entries.is_empty() {
                    println!("no datasets");
                }
                for e in entries {
                    println!(
                        "{}  rows={} chunks={} fields={} views=[{}] updated={}",
                        e.dataset_id.bold(),
                        e.row_count,
                        e.chunks.len(),
                        e.schema.len(),
                        e.views.join(", "),
                        e.updated_at
                    );
                }
            })?;
            Ok(0)
        }
        Command::Queries { format } => {
            let queries: Vec<_> = CannedQueryRegistry::global().iter().collect();
            emit(format, &queries, |queries: &Vec<_>| {
                for q in queries {
                    println!("{}  {}", q.name.bold(), q.description);
                    for p in q.params {
                        let note = match p.default {
                            Some(d) => format!("default {d}"),
                            None => "required".to_string(),
                        };
                        println!("    --param {}=<{:?}>  {} ({})", p.name, p.kind, p.description, note);
                    }
                }
            })?;
            Ok(0)
        }
    }
}

fn exit_code(result: &QueryResult) -> i32 {
    if result.outcome.is_no_result() {
        EXIT_NO_RESULT
    } else {
        0
    }
}

/// `key=value` pairs; values that parse as JSON keep their JSON type.
fn parse_params(raw: &[String]) -> Result<QueryParams, NexusError> {
    let mut params = QueryParams::new();
    for item in raw {
        let (key, value) = item.split_once('=').ok_or_else(|| {
            NexusError::ValidationError(format!("parameter '{item}' is not key=value"))
        })?;
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        params.insert(key.trim().to_string(), value);
    }
    Ok(params)
}

fn emit<T: Serialize>(format: OutputFormat, value: &T, text: impl Fn(&T)) -> Result<(), NexusError> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => text(value),
    }
    Ok(())
}

fn print_summary(s: &IngestSummary) {
    println!(
        "{} ingested {} rows into {} (view {})",
        "✓".bright_green(),
        s.rows_ingested.to_string().bold(),
        s.dataset_id.bold(),
        s.view
    );
    println!("  malformed lines: {}", s.rows_malformed);
    println!("  chunks written:  {}", s.chunks_written);
    for w in &s.warnings {
        println!("  {} {}", "⚠".bright_yellow(), w);
    }
}

fn print_result(r: &QueryResult) {
    match &r.outcome {
        QueryOutcome::NoResult => println!("{} no result", "∅".bright_yellow()),
        QueryOutcome::Rows { columns, rows } => {
            println!("{}", columns.join("\t").bold());
            for row in rows {
                let cells: Vec<String> = row
                    .iter()
                    .map(|v| match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect();
                println!("{}", cells.join("\t"));
            }
        }
    }
    println!("{} {}", "sql:".dimmed(), r.sql);
    println!("{} {}", "evidence:".dimmed(), r.evidence);
    match r.confidence {
        Some(c) => println!("{} {:.2}", "confidence:".dimmed(), c),
        None => println!("{} n/a", "confidence:".dimmed()),
    }
}
