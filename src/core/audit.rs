//! Audit events for ingestion jobs and canned-query invocations.
//!
//! The core only builds the event payload and hands it to an [`AuditSink`].
//! [`JsonlAuditSink`] is the default writer: one JSON object per line,
//! appended to `<data_dir>/audit.log`.

use crate::core::error::NexusError;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub ts: String,
    pub event_id: String,
    pub module: String,
    pub action: String,
    pub target: String,
    pub success: bool,
    pub notes: serde_json::Value,
}

impl AuditEvent {
    pub fn new(
        module: &str,
        action: &str,
        target: &str,
        success: bool,
        notes: serde_json::Value,
    ) -> Self {
        Self {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            module: module.to_string(),
            action: action.to_string(),
            target: target.to_string(),
            success,
            notes,
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn emit(&self, event: &AuditEvent) -> Result<(), NexusError>;
}

/// Emit and downgrade a sink failure to a warning. An operation that already
/// committed must not be reported as failed because its audit line was lost.
pub fn emit_or_warn(sink: &dyn AuditSink, event: &AuditEvent) {
    if let Err(e) = sink.emit(event) {
        tracing::warn!(
            module = %event.module,
            action = %event.action,
            error = %e,
            "failed to write audit event"
        );
    }
}

pub struct JsonlAuditSink {
    path: PathBuf,
}

impl JsonlAuditSink {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditSink {
    fn emit(&self, event: &AuditEvent) -> Result<(), NexusError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(NexusError::IoError)?;
        }
        // One write per event: O_APPEND keeps concurrent appenders from interleaving.
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(NexusError::IoError)?;
        f.write_all(line.as_bytes()).map_err(NexusError::IoError)?;
        Ok(())
    }
}

/// Keeps events in memory. Used by tests and by embedders that forward events elsewhere.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, event: &AuditEvent) -> Result<(), NexusError> {
        self.events
            .lock()
            .map_err(|_| NexusError::ValidationError("audit buffer poisoned".to_string()))?
            .push(event.clone());
        Ok(())
    }
}
