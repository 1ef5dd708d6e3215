//! On-disk layout of a lognexus data directory.
//!
//! ```text
//! <data_dir>/
//!   parquet/<dataset-id>/<seq>.parquet   immutable chunks, seq from 0
//!   duckdb/catalog.db                    dataset catalog + view registry
//!   locks/<dataset-id>.lock              cross-process writer lock per dataset
//!   audit.log                            NDJSON audit events
//! ```

use crate::core::error::NexusError;
use std::fs;
use std::path::{Path, PathBuf};

pub const PARQUET_DIR_NAME: &str = "parquet";
pub const CATALOG_DIR_NAME: &str = "duckdb";
pub const CATALOG_FILE_NAME: &str = "catalog.db";
pub const AUDIT_LOG_NAME: &str = "audit.log";
pub const LOCKS_DIR_NAME: &str = "locks";
pub const CHUNK_EXT: &str = "parquet";
pub const TEMP_SUFFIX: &str = "tmp";

/// Handle to a data directory root.
#[derive(Debug, Clone)]
pub struct DataDir {
    /// Absolute or caller-relative path to the data directory root
    pub root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the directory skeleton if it does not exist yet.
    pub fn ensure(&self) -> Result<(), NexusError> {
        fs::create_dir_all(self.root.join(PARQUET_DIR_NAME)).map_err(NexusError::IoError)?;
        fs::create_dir_all(self.root.join(CATALOG_DIR_NAME)).map_err(NexusError::IoError)?;
        fs::create_dir_all(self.root.join(LOCKS_DIR_NAME)).map_err(NexusError::IoError)?;
        Ok(())
    }

    pub fn dataset_dir(&self, dataset_id: &str) -> PathBuf {
        self.root.join(PARQUET_DIR_NAME).join(dataset_id)
    }

    pub fn chunk_path(&self, dataset_id: &str, seq: u64) -> PathBuf {
        self.dataset_dir(dataset_id).join(chunk_file_name(seq))
    }

    pub fn temp_chunk_path(&self, dataset_id: &str, seq: u64) -> PathBuf {
        self.dataset_dir(dataset_id)
            .join(format!("{}.{}", chunk_file_name(seq), TEMP_SUFFIX))
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.root.join(CATALOG_DIR_NAME).join(CATALOG_FILE_NAME)
    }

    /// Lock file held by the single writer of `dataset_id`, across processes.
    pub fn writer_lock_path(&self, dataset_id: &str) -> PathBuf {
        self.root
            .join(LOCKS_DIR_NAME)
            .join(format!("{dataset_id}.lock"))
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.root.join(AUDIT_LOG_NAME)
    }
}

pub fn chunk_file_name(seq: u64) -> String {
    format!("{}.{}", seq, CHUNK_EXT)
}

/// Parse `<seq>.parquet` back into its sequence number.
pub fn parse_chunk_file_name(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(&format!(".{}", CHUNK_EXT))?;
    stem.parse::<u64>().ok()
}
