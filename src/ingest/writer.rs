//! Chunked writer.
//!
//! Rows are buffered in ingestion order and flushed every `chunk_size` rows.
//! A flush encodes the buffer, writes `<seq>.parquet.tmp`, fsyncs it and publishes
//! it as `<seq>.parquet` with a hard link, then drops the temporary name. Linking
//! fails when the destination exists, so a flush never replaces a chunk already
//! on disk. Until the link succeeds nothing named like a chunk exists, and until
//! the catalog commits nothing references it.

use crate::core::catalog::ChunkRecord;
use crate::core::error::NexusError;
use crate::core::model::{Row, Schema};
use crate::core::store::{self, DataDir, TEMP_SUFFIX};
use crate::core::time;
use crate::ingest::chunk::{self, LineRow};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;

pub struct ChunkWriter {
    data_dir: DataDir,
    dataset_id: String,
    chunk_size: usize,
    next_seq: u64,
    buffer: Vec<LineRow>,
    written: Vec<ChunkRecord>,
}

impl ChunkWriter {
    /// `next_seq` is the first sequence number this writer may use; it must equal
    /// the committed entry's next sequence number.
    pub fn new(
        data_dir: &DataDir,
        dataset_id: &str,
        next_seq: u64,
        chunk_size: usize,
    ) -> Result<Self, NexusError> {
        if chunk_size == 0 {
            return Err(NexusError::ValidationError(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        fs::create_dir_all(data_dir.dataset_dir(dataset_id)).map_err(NexusError::IoError)?;
        Ok(Self {
            data_dir: data_dir.clone(),
            dataset_id: dataset_id.to_string(),
            chunk_size,
            next_seq,
            buffer: Vec::with_capacity(chunk_size.min(65_536)),
            written: Vec::new(),
        })
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Chunks persisted by this writer so far (not yet committed to the catalog).
    pub fn written(&self) -> &[ChunkRecord] {
        &self.written
    }

    /// Buffer one row; flushes when the threshold is reached.
    pub fn push(
        &mut self,
        line: u64,
        row: Row,
        schema: &Schema,
    ) -> Result<Option<ChunkRecord>, NexusError> {
        self.buffer.push(LineRow { line, row });
        if self.buffer.len() >= self.chunk_size {
            return self.flush(schema).map(Some);
        }
        Ok(None)
    }

    /// Flush whatever is buffered as a final, possibly undersized chunk and return
    /// every chunk written by this writer.
    pub fn finish(&mut self, schema: &Schema) -> Result<Vec<ChunkRecord>, NexusError> {
        if !self.buffer.is_empty() {
            self.flush(schema)?;
        }
        Ok(self.written.clone())
    }

    /// Remove every chunk file this writer created. Only valid before those chunks
    /// are committed; the job calls it when it aborts.
    pub fn discard(&mut self) {
        for chunk in self.written.drain(..) {
            let path = self.data_dir.chunk_path(&self.dataset_id, chunk.seq);
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove uncommitted chunk");
            }
        }
        self.buffer.clear();
    }

    fn flush(&mut self, schema: &Schema) -> Result<ChunkRecord, NexusError> {
        let seq = self.next_seq;
        let rows = std::mem::take(&mut self.buffer);
        let fail = |reason: String| NexusError::ChunkWrite {
            dataset_id: self.dataset_id.clone(),
            seq,
            reason,
        };

        let bytes = chunk::encode_chunk(schema, &rows).map_err(|e| fail(e.to_string()))?;
        let tmp = self.data_dir.temp_chunk_path(&self.dataset_id, seq);
        let dest = self.data_dir.chunk_path(&self.dataset_id, seq);

        let persisted = (|| -> std::io::Result<()> {
            let mut f = File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
            drop(f);
            fs::hard_link(&tmp, &dest)?;
            fs::remove_file(&tmp)?;
            sync_dir(&self.data_dir.dataset_dir(&self.dataset_id));
            Ok(())
        })();
        if let Err(e) = persisted {
            let _ = fs::remove_file(&tmp);
            tracing::warn!(dataset_id = %self.dataset_id, seq, error = %e, "chunk publish failed");
            return Err(fail(e.to_string()));
        }

        let record = ChunkRecord {
            seq,
            file_name: store::chunk_file_name(seq),
            row_count: rows.len() as u64,
            content_sha256: format!("{:x}", Sha256::digest(&bytes)),
            created_at: time::now_epoch_z(),
        };
        tracing::debug!(
            dataset_id = %self.dataset_id,
            seq,
            rows = record.row_count,
            bytes = bytes.len(),
            "chunk flushed"
        );
        self.next_seq += 1;
        self.written.push(record.clone());
        Ok(record)
    }
}

#[cfg(unix)]
fn sync_dir(dir: &std::path::Path) {
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &std::path::Path) {}

/// Delete files in a dataset directory that the catalog does not reference:
/// temporaries and chunks at or past `committed_next_seq` left by a crashed job.
/// Returns the number of files removed. Directories are never touched.
pub fn sweep_orphans(
    data_dir: &DataDir,
    dataset_id: &str,
    committed_next_seq: u64,
) -> Result<usize, NexusError> {
    let dir = data_dir.dataset_dir(dataset_id);
    if !dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(&dir).map_err(NexusError::IoError)? {
        let entry = entry.map_err(NexusError::IoError)?;
        let path = entry.path();
        if !entry.file_type().map_err(NexusError::IoError)?.is_file() {
            continue;
        }
        let is_temp = path
            .extension()
            .map(|ext| ext == TEMP_SUFFIX)
            .unwrap_or(false);
        let is_orphan_chunk = store::parse_chunk_file_name(&path)
            .map(|seq| seq >= committed_next_seq)
            .unwrap_or(false);
        if is_temp || is_orphan_chunk {
            fs::remove_file(&path).map_err(NexusError::IoError)?;
            tracing::info!(path = %path.display(), "removed orphan chunk file");
            removed += 1;
        }
    }
    Ok(removed)
}
