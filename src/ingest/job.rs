//! One ingestion job: `Open -> Reading -> FinalFlush -> CatalogUpsert -> Closed`.
//!
//! Per-record problems (undecodable lines, type conflicts) are counted and
//! reported in the summary. Structural problems abort the job: chunk files it
//! wrote are removed and the catalog keeps its pre-job state.

use crate::core::audit::{self, AuditEvent, AuditSink};
use crate::core::catalog::Catalog;
use crate::core::config::{NexusConfig, validate_dataset_id, validate_view_name};
use crate::core::error::NexusError;
use crate::core::model::Schema;
use crate::core::time;
use crate::ingest::infer::{self, SchemaInferencer, SchemaWarning};
use crate::ingest::writer::{self, ChunkWriter};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub dataset_id: String,
    pub view: String,
    pub rows_ingested: u64,
    pub rows_malformed: u64,
    pub chunks_written: usize,
    pub warnings: Vec<SchemaWarning>,
}

#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
    /// Target dataset; derived from `source_name` when absent.
    pub dataset_id: Option<String>,
    /// Name of the input (usually its file name), used for derived ids and audit.
    pub source_name: String,
    /// View to (re)register; the configured default when absent.
    pub view: Option<String>,
}

impl IngestRequest {
    pub fn new(source_name: &str) -> Self {
        Self {
            source_name: source_name.to_string(),
            ..Self::default()
        }
    }

    pub fn dataset(mut self, dataset_id: &str) -> Self {
        self.dataset_id = Some(dataset_id.to_string());
        self
    }

    pub fn view(mut self, view: &str) -> Self {
        self.view = Some(view.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Open,
    Reading,
    FinalFlush,
    CatalogUpsert,
    Closed,
}

/// Counters carried through a job so an abort can report them.
struct Progress {
    state: JobState,
    rows_ingested: u64,
    rows_malformed: u64,
    warnings: Vec<SchemaWarning>,
}

pub struct Ingestor<'a> {
    catalog: &'a Catalog,
    config: &'a NexusConfig,
    audit: &'a dyn AuditSink,
}

impl<'a> Ingestor<'a> {
    pub fn new(catalog: &'a Catalog, config: &'a NexusConfig, audit: &'a dyn AuditSink) -> Self {
        Self {
            catalog,
            config,
            audit,
        }
    }

    /// Ingest one NDJSON stream into a dataset.
    pub fn ingest<R: BufRead>(
        &self,
        reader: R,
        request: IngestRequest,
    ) -> Result<IngestSummary, NexusError> {
        let dataset_id = match &request.dataset_id {
            Some(id) => id.clone(),
            None => derive_dataset_id(&request.source_name),
        };
        let view = request
            .view
            .clone()
            .unwrap_or_else(|| self.config.default_view.clone());
        validate_dataset_id(&dataset_id)?;
        validate_view_name(&view)?;

        let outcome = self.catalog.with_dataset_lock(&dataset_id, || {
            self.run_locked(reader, &dataset_id, &view)
        });

        let event = match &outcome {
            Ok(summary) => AuditEvent::new(
                "log",
                "ingest",
                &request.source_name,
                true,
                serde_json::json!({
                    "dataset_id": summary.dataset_id,
                    "view": summary.view,
                    "rows_ingested": summary.rows_ingested,
                    "rows_malformed": summary.rows_malformed,
                    "chunks_written": summary.chunks_written,
                    "warnings": summary.warnings.len(),
                }),
            ),
            Err(e) => AuditEvent::new(
                "log",
                "ingest",
                &request.source_name,
                false,
                serde_json::json!({
                    "dataset_id": dataset_id,
                    "error_kind": e.kind(),
                    "error": e.to_string(),
                }),
            ),
        };
        audit::emit_or_warn(self.audit, &event);
        outcome
    }

    fn run_locked<R: BufRead>(
        &self,
        reader: R,
        dataset_id: &str,
        view: &str,
    ) -> Result<IngestSummary, NexusError> {
        let prior = self.catalog.lookup(dataset_id)?;
        let (mut schema, next_seq) = match &prior {
            Some(entry) => (entry.schema.clone(), entry.next_seq()),
            None => (Schema::new(), 0),
        };
        let data_dir = self.catalog.data_dir();
        writer::sweep_orphans(data_dir, dataset_id, next_seq)?;
        let mut chunk_writer =
            ChunkWriter::new(data_dir, dataset_id, next_seq, self.config.chunk_size)?;

        let mut progress = Progress {
            state: JobState::Open,
            rows_ingested: 0,
            rows_malformed: 0,
            warnings: Vec::new(),
        };
        tracing::info!(dataset_id, next_seq, "ingestion job opened");

        match self.drive(reader, dataset_id, view, &mut schema, &mut chunk_writer, &mut progress) {
            Ok(chunks_written) => {
                progress.state = JobState::Closed;
                tracing::info!(
                    dataset_id,
                    rows_ingested = progress.rows_ingested,
                    rows_malformed = progress.rows_malformed,
                    chunks_written,
                    warnings = progress.warnings.len(),
                    "ingestion job closed"
                );
                Ok(IngestSummary {
                    dataset_id: dataset_id.to_string(),
                    view: view.to_string(),
                    rows_ingested: progress.rows_ingested,
                    rows_malformed: progress.rows_malformed,
                    chunks_written,
                    warnings: progress.warnings,
                })
            }
            Err(cause) => {
                tracing::error!(
                    dataset_id,
                    state = ?progress.state,
                    error = %cause,
                    "ingestion job aborted"
                );
                chunk_writer.discard();
                Err(NexusError::JobAborted {
                    dataset_id: dataset_id.to_string(),
                    rows_ingested: progress.rows_ingested,
                    rows_malformed: progress.rows_malformed,
                    cause: Box::new(cause),
                })
            }
        }
    }

    fn drive<R: BufRead>(
        &self,
        reader: R,
        dataset_id: &str,
        view: &str,
        schema: &mut Schema,
        chunk_writer: &mut ChunkWriter,
        progress: &mut Progress,
    ) -> Result<usize, NexusError> {
        let inferencer = SchemaInferencer::new(self.config.numeric_widening);
        let leading_limit = self.config.leading_malformed_limit as u64;
        progress.state = JobState::Reading;

        for (idx, raw) in reader.split(b'\n').enumerate() {
            let raw = raw.map_err(NexusError::IoError)?;
            let line_no = idx as u64 + 1;
            let trimmed = raw.trim_ascii();
            if trimmed.is_empty() {
                continue;
            }

            let value: serde_json::Value = match serde_json::from_slice(trimmed) {
                Ok(v) => v,
                Err(e) => {
                    progress.rows_malformed += 1;
                    tracing::debug!(dataset_id, line = line_no, error = %e, "malformed line skipped");
                    if progress.rows_ingested == 0 && progress.rows_malformed >= leading_limit {
                        return Err(NexusError::MalformedInput {
                            malformed: progress.rows_malformed,
                        });
                    }
                    continue;
                }
            };

            let record = infer::as_record(value);
            let row = inferencer.infer_record(&record, schema, line_no, &mut progress.warnings);
            chunk_writer.push(line_no, row, schema)?;
            progress.rows_ingested += 1;
        }

        progress.state = JobState::FinalFlush;
        let chunks = chunk_writer.finish(schema)?;

        progress.state = JobState::CatalogUpsert;
        self.catalog.commit(dataset_id, &chunks, schema, Some(view))?;
        Ok(chunks.len())
    }
}

/// `<input-stem>-<YYYYmmddHHMMSS>`, with characters outside the id alphabet replaced.
pub fn derive_dataset_id(source_name: &str) -> String {
    let stem = Path::new(source_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("");
    let mut clean: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(100)
        .collect();
    if !clean.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        clean.insert_str(0, "ds");
    }
    format!("{}-{}", clean, time::dataset_stamp(Utc::now()))
}
