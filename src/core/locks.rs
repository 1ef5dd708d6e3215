//! Per-dataset writer locks.
//!
//! Ingestion into one dataset id is serialized at two levels: a mutex owned by
//! that id inside the process, and an exclusive OS lock on
//! `<data_dir>/locks/<id>.lock` across processes. Distinct ids never contend.
//! Readers take no lock: they rely on the catalog's SQLite read transactions for
//! snapshot isolation.

use crate::core::error::NexusError;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct DatasetLocks {
    entries: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DatasetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_entry(&self, dataset_id: &str) -> Result<Arc<Mutex<()>>, NexusError> {
        let mut entries = self.entries.lock().map_err(|_| {
            NexusError::ValidationError("dataset lock table poisoned".to_string())
        })?;
        Ok(entries
            .entry(dataset_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    /// Run `f` while holding the in-process single-writer lock for `dataset_id`.
    pub fn with_write<F, R>(&self, dataset_id: &str, f: F) -> Result<R, NexusError>
    where
        F: FnOnce() -> Result<R, NexusError>,
    {
        let entry = self.get_entry(dataset_id)?;
        // A panicked writer leaves nothing committed; the catalog is still consistent.
        let _guard = entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f()
    }
}

/// Exclusive lock on a writer lock file. Released when dropped, or by the OS
/// when the holding process dies.
#[derive(Debug)]
pub struct WriterLease {
    path: PathBuf,
    _file: File,
}

impl WriterLease {
    /// Block until the lock at `path` is held.
    pub fn acquire(path: &Path) -> Result<Self, NexusError> {
        let file = open_lock_file(path)?;
        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                tracing::info!(path = %path.display(), "waiting for another writer");
                file.lock().map_err(NexusError::IoError)?;
            }
            Err(TryLockError::Error(e)) => return Err(NexusError::IoError(e)),
        }
        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    /// Take the lock at `path` only if nobody holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, NexusError> {
        let file = open_lock_file(path)?;
        match file.try_lock() {
            Ok(()) => Ok(Some(Self {
                path: path.to_path_buf(),
                _file: file,
            })),
            Err(TryLockError::WouldBlock) => Ok(None),
            Err(TryLockError::Error(e)) => Err(NexusError::IoError(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// The file itself is never removed: unlinking a lock file another process is
// waiting on would let a third process lock a fresh inode.
fn open_lock_file(path: &Path) -> Result<File, NexusError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(NexusError::IoError)?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(NexusError::IoError)
}
