use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NexusError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Parquet error: {0}")]
    ParquetError(#[from] parquet::errors::ParquetError),
    #[error("Arrow error: {0}")]
    ArrowError(#[from] arrow_schema::ArrowError),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Malformed input: the first {malformed} non-blank lines failed to decode")]
    MalformedInput { malformed: u64 },
    #[error("Chunk write failed for dataset '{dataset_id}' (seq {seq}): {reason}")]
    ChunkWrite {
        dataset_id: String,
        seq: u64,
        reason: String,
    },
    #[error("Catalog upsert failed for dataset '{dataset_id}': {reason}")]
    CatalogUpsert { dataset_id: String, reason: String },
    #[error(
        "Ingestion into '{dataset_id}' aborted after {rows_ingested} rows ({rows_malformed} malformed): {cause}"
    )]
    JobAborted {
        dataset_id: String,
        rows_ingested: u64,
        rows_malformed: u64,
        #[source]
        cause: Box<NexusError>,
    },
    #[error("Unknown canned query: {0}")]
    UnknownQuery(String),
    #[error("Missing parameter '{param}' for query '{query}'")]
    MissingParameter { query: String, param: String },
    #[error("Invalid parameter '{param}' for query '{query}': {reason}")]
    InvalidParameter {
        query: String,
        param: String,
        reason: String,
    },
    #[error("Query '{query}' timed out after {timeout_ms} ms")]
    QueryTimeout { query: String, timeout_ms: u64 },
    #[error("Query '{query}' failed: {reason}")]
    QueryFailed { query: String, reason: String },
}

impl NexusError {
    /// Stable short name used in audit notes and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            NexusError::RusqliteError(_) => "sqlite",
            NexusError::IoError(_) => "io",
            NexusError::JsonError(_) => "json",
            NexusError::ParquetError(_) => "parquet",
            NexusError::ArrowError(_) => "arrow",
            NexusError::ConfigError(_) => "config",
            NexusError::ValidationError(_) => "validation",
            NexusError::NotFound(_) => "not_found",
            NexusError::MalformedInput { .. } => "malformed_input",
            NexusError::ChunkWrite { .. } => "chunk_write_failure",
            NexusError::CatalogUpsert { .. } => "catalog_upsert_failure",
            NexusError::JobAborted { cause, .. } => cause.kind(),
            NexusError::UnknownQuery(_) => "unknown_query",
            NexusError::MissingParameter { .. } => "missing_parameter",
            NexusError::InvalidParameter { .. } => "invalid_parameter",
            NexusError::QueryTimeout { .. } => "query_timeout",
            NexusError::QueryFailed { .. } => "query_failed",
        }
    }
}
