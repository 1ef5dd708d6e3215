//! Runtime configuration.
//!
//! Loaded from an optional TOML file; every key has a default, so an empty file
//! (or no file) is a valid configuration.
//!
//! ```toml
//! data_dir = "/var/lib/lognexus"
//! default_view = "logs"
//! chunk_size = 10000
//! leading_malformed_limit = 20
//! query_timeout_ms = 30000
//! numeric_widening = "float"
//! log_level = "info"
//! ```

use crate::core::error::NexusError;
use crate::core::store::DataDir;
use crate::ingest::infer::NumericWidening;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

pub const DEFAULT_VIEW: &str = "logs";
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;
pub const DEFAULT_LEADING_MALFORMED_LIMIT: usize = 20;
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_LOG_LEVEL: &str = "info";

static VIEW_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").unwrap());
static DATASET_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,127}$").unwrap());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NexusConfig {
    pub data_dir: PathBuf,
    pub default_view: String,
    /// Rows per chunk file.
    pub chunk_size: usize,
    /// Abort a job when this many leading non-blank lines fail to decode.
    pub leading_malformed_limit: usize,
    pub query_timeout_ms: u64,
    pub numeric_widening: NumericWidening,
    pub log_level: Option<String>,
}

impl Default for NexusConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            default_view: DEFAULT_VIEW.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            leading_malformed_limit: DEFAULT_LEADING_MALFORMED_LIMIT,
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
            numeric_widening: NumericWidening::default(),
            log_level: None,
        }
    }
}

impl NexusConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, NexusError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            NexusError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, NexusError> {
        let config: NexusConfig =
            toml::from_str(raw).map_err(|e| NexusError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), NexusError> {
        if self.chunk_size == 0 {
            return Err(NexusError::ConfigError(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.leading_malformed_limit == 0 {
            return Err(NexusError::ConfigError(
                "leading_malformed_limit must be greater than zero".to_string(),
            ));
        }
        if self.query_timeout_ms == 0 {
            return Err(NexusError::ConfigError(
                "query_timeout_ms must be greater than zero".to_string(),
            ));
        }
        validate_view_name(&self.default_view)
            .map_err(|e| NexusError::ConfigError(format!("default_view: {e}")))?;
        Ok(())
    }

    pub fn data_dir(&self) -> DataDir {
        DataDir::new(&self.data_dir)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

pub fn validate_view_name(name: &str) -> Result<(), NexusError> {
    if VIEW_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(NexusError::ValidationError(format!(
            "invalid view name '{name}': expected [A-Za-z_][A-Za-z0-9_]*, at most 64 characters"
        )))
    }
}

pub fn validate_dataset_id(id: &str) -> Result<(), NexusError> {
    if DATASET_ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(NexusError::ValidationError(format!(
            "invalid dataset id '{id}': expected [A-Za-z0-9][A-Za-z0-9_.-]*, at most 128 characters"
        )))
    }
}
