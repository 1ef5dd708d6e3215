//! Dataset catalog: the durable directory of datasets, their chunks and views.
//!
//! Every mutation runs in one IMMEDIATE SQLite transaction, so an entry is either
//! fully updated or untouched. Every read runs in one read transaction, so readers
//! observe a single committed state even while an ingest is committing.
//!
//! Chunks are only ever added to the catalog after their files were atomically
//! linked into place, which keeps partially written chunks invisible.

use crate::core::config::{validate_dataset_id, validate_view_name};
use crate::core::db;
use crate::core::error::NexusError;
use crate::core::locks::{DatasetLocks, WriterLease};
use crate::core::model::Schema;
use crate::core::store::DataDir;
use crate::core::time;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub seq: u64,
    pub file_name: String,
    pub row_count: u64,
    pub content_sha256: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub dataset_id: String,
    pub schema: Schema,
    pub chunks: Vec<ChunkRecord>,
    pub row_count: u64,
    pub created_at: String,
    pub updated_at: String,
    pub views: Vec<String>,
}

impl CatalogEntry {
    /// Sequence number the next chunk of this dataset must use.
    pub fn next_seq(&self) -> u64 {
        self.chunks.last().map(|c| c.seq + 1).unwrap_or(0)
    }
}

/// Explicit catalog service. Construct one per data directory and share it by reference.
pub struct Catalog {
    data_dir: DataDir,
    db_path: PathBuf,
    locks: DatasetLocks,
}

impl Catalog {
    pub fn open(data_dir: &DataDir) -> Result<Self, NexusError> {
        data_dir.ensure()?;
        let db_path = data_dir.catalog_path();
        db::initialize_catalog_db(&db_path)?;
        Ok(Self {
            data_dir: data_dir.clone(),
            db_path,
            locks: DatasetLocks::new(),
        })
    }

    pub fn data_dir(&self) -> &DataDir {
        &self.data_dir
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    /// Run `f` as the single writer of `dataset_id`, among this process's threads
    /// and among every process sharing the data directory.
    pub fn with_dataset_lock<F, R>(&self, dataset_id: &str, f: F) -> Result<R, NexusError>
    where
        F: FnOnce() -> Result<R, NexusError>,
    {
        validate_dataset_id(dataset_id)?;
        self.locks.with_write(dataset_id, || {
            let _lease = WriterLease::acquire(&self.data_dir.writer_lock_path(dataset_id))?;
            f()
        })
    }

    /// Atomically extend `dataset_id` with `new_chunks` and the widened `schema`.
    ///
    /// Creates the entry on first use. On any failure the entry is left exactly as
    /// it was and `CatalogUpsert` is returned.
    pub fn upsert(
        &self,
        dataset_id: &str,
        new_chunks: &[ChunkRecord],
        schema: &Schema,
    ) -> Result<CatalogEntry, NexusError> {
        self.commit(dataset_id, new_chunks, schema, None)
    }

    /// `upsert` plus view registration in the same transaction.
    pub fn commit(
        &self,
        dataset_id: &str,
        new_chunks: &[ChunkRecord],
        schema: &Schema,
        view: Option<&str>,
    ) -> Result<CatalogEntry, NexusError> {
        let wrap = |reason: String| NexusError::CatalogUpsert {
            dataset_id: dataset_id.to_string(),
            reason,
        };
        validate_dataset_id(dataset_id).map_err(|e| wrap(e.to_string()))?;
        if let Some(view) = view {
            validate_view_name(view).map_err(|e| wrap(e.to_string()))?;
        }

        let mut conn = db::db_connect(&self.db_path).map_err(|e| wrap(e.to_string()))?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| wrap(e.to_string()))?;

        upsert_in_tx(&tx, dataset_id, new_chunks, schema).map_err(|e| match e {
            NexusError::CatalogUpsert { .. } => e,
            other => wrap(other.to_string()),
        })?;
        if let Some(view) = view {
            register_view_in_tx(&tx, dataset_id, view).map_err(|e| wrap(e.to_string()))?;
        }
        let entry = read_entry(&tx, dataset_id)
            .map_err(|e| wrap(e.to_string()))?
            .ok_or_else(|| wrap("entry vanished inside its own transaction".to_string()))?;
        tx.commit().map_err(|e| wrap(e.to_string()))?;

        tracing::info!(
            dataset_id,
            new_chunks = new_chunks.len(),
            row_count = entry.row_count,
            "catalog entry committed"
        );
        Ok(entry)
    }

    /// Make `dataset_id` queryable as `view_name`. Re-registering a name repoints it.
    pub fn register_view(&self, dataset_id: &str, view_name: &str) -> Result<(), NexusError> {
        validate_view_name(view_name)?;
        let mut conn = db::db_connect(&self.db_path)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        register_view_in_tx(&tx, dataset_id, view_name)?;
        tx.commit()?;
        tracing::debug!(dataset_id, view_name, "view registered");
        Ok(())
    }

    pub fn lookup(&self, dataset_id: &str) -> Result<Option<CatalogEntry>, NexusError> {
        let mut conn = db::db_connect(&self.db_path)?;
        let tx = conn.transaction()?;
        let entry = read_entry(&tx, dataset_id)?;
        tx.commit()?;
        Ok(entry)
    }

    /// Resolve a view name to the committed entry it points at.
    pub fn resolve_view(&self, view_name: &str) -> Result<Option<CatalogEntry>, NexusError> {
        let mut conn = db::db_connect(&self.db_path)?;
        let tx = conn.transaction()?;
        let dataset_id: Option<String> = tx
            .query_row(
                "SELECT dataset_id FROM views WHERE view_name = ?1",
                params![view_name],
                |row| row.get(0),
            )
            .optional()?;
        let entry = match dataset_id {
            Some(id) => read_entry(&tx, &id)?,
            None => None,
        };
        tx.commit()?;
        Ok(entry)
    }

    /// View names currently pointing at `dataset_id`.
    pub fn views(&self, dataset_id: &str) -> Result<Vec<String>, NexusError> {
        let conn = db::db_connect(&self.db_path)?;
        let mut stmt =
            conn.prepare("SELECT view_name FROM views WHERE dataset_id = ?1 ORDER BY view_name")?;
        let rows = stmt.query_map(params![dataset_id], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for r in rows {
            names.push(r?);
        }
        Ok(names)
    }

    pub fn list(&self) -> Result<Vec<CatalogEntry>, NexusError> {
        let mut conn = db::db_connect(&self.db_path)?;
        let tx = conn.transaction()?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare("SELECT id FROM datasets ORDER BY id")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            out
        };
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = read_entry(&tx, &id)? {
                entries.push(entry);
            }
        }
        tx.commit()?;
        Ok(entries)
    }
}

fn upsert_in_tx(
    tx: &Transaction<'_>,
    dataset_id: &str,
    new_chunks: &[ChunkRecord],
    schema: &Schema,
) -> Result<(), NexusError> {
    let fail = |reason: String| NexusError::CatalogUpsert {
        dataset_id: dataset_id.to_string(),
        reason,
    };
    let now = time::now_epoch_z();

    let existing: Option<(String, i64)> = tx
        .query_row(
            "SELECT schema_json, row_count FROM datasets WHERE id = ?1",
            params![dataset_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let next_seq: i64 = tx.query_row(
        "SELECT COALESCE(MAX(seq) + 1, 0) FROM chunks WHERE dataset_id = ?1",
        params![dataset_id],
        |row| row.get(0),
    )?;

    for (offset, chunk) in new_chunks.iter().enumerate() {
        let expected = next_seq as u64 + offset as u64;
        if chunk.seq != expected {
            return Err(fail(format!(
                "chunk sequence gap: expected seq {expected}, got {}",
                chunk.seq
            )));
        }
    }

    let added_rows: u64 = new_chunks.iter().map(|c| c.row_count).sum();
    let schema_json = serde_json::to_string(schema)?;

    match existing {
        Some((prior_json, prior_rows)) => {
            let prior: Schema = serde_json::from_str(&prior_json)?;
            if !schema.is_widening_of(&prior) {
                return Err(fail("schema update would narrow an existing field".to_string()));
            }
            tx.execute(
                "UPDATE datasets SET schema_json = ?1, row_count = ?2, updated_at = ?3 WHERE id = ?4",
                params![schema_json, prior_rows + added_rows as i64, now, dataset_id],
            )?;
        }
        None => {
            tx.execute(
                "INSERT INTO datasets(id, schema_json, row_count, created_at, updated_at) VALUES(?1, ?2, ?3, ?4, ?4)",
                params![dataset_id, schema_json, added_rows as i64, now],
            )?;
        }
    }

    for chunk in new_chunks {
        tx.execute(
            "INSERT INTO chunks(dataset_id, seq, file_name, row_count, content_sha256, created_at) VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                dataset_id,
                chunk.seq as i64,
                chunk.file_name,
                chunk.row_count as i64,
                chunk.content_sha256,
                chunk.created_at
            ],
        )?;
    }
    Ok(())
}

fn register_view_in_tx(
    tx: &Transaction<'_>,
    dataset_id: &str,
    view_name: &str,
) -> Result<(), NexusError> {
    let exists: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM datasets WHERE id = ?1",
            params![dataset_id],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(NexusError::NotFound(format!("dataset '{dataset_id}'")));
    }
    tx.execute(
        "INSERT INTO views(view_name, dataset_id, registered_at) VALUES(?1, ?2, ?3)
         ON CONFLICT(view_name) DO UPDATE SET dataset_id = excluded.dataset_id, registered_at = excluded.registered_at",
        params![view_name, dataset_id, time::now_epoch_z()],
    )?;
    Ok(())
}

fn read_entry(conn: &Connection, dataset_id: &str) -> Result<Option<CatalogEntry>, NexusError> {
    let head: Option<(String, i64, String, String)> = conn
        .query_row(
            "SELECT schema_json, row_count, created_at, updated_at FROM datasets WHERE id = ?1",
            params![dataset_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;
    let Some((schema_json, row_count, created_at, updated_at)) = head else {
        return Ok(None);
    };
    let schema: Schema = serde_json::from_str(&schema_json)?;

    let mut stmt = conn.prepare(
        "SELECT seq, file_name, row_count, content_sha256, created_at FROM chunks WHERE dataset_id = ?1 ORDER BY seq",
    )?;
    let rows = stmt.query_map(params![dataset_id], |row| {
        Ok(ChunkRecord {
            seq: row.get::<_, i64>(0)? as u64,
            file_name: row.get(1)?,
            row_count: row.get::<_, i64>(2)? as u64,
            content_sha256: row.get(3)?,
            created_at: row.get(4)?,
        })
    })?;
    let mut chunks = Vec::new();
    for r in rows {
        chunks.push(r?);
    }

    let mut stmt =
        conn.prepare("SELECT view_name FROM views WHERE dataset_id = ?1 ORDER BY view_name")?;
    let rows = stmt.query_map(params![dataset_id], |row| row.get::<_, String>(0))?;
    let mut views = Vec::new();
    for r in rows {
        views.push(r?);
    }

    Ok(Some(CatalogEntry {
        dataset_id: dataset_id.to_string(),
        schema,
        chunks,
        row_count: row_count as u64,
        created_at,
        updated_at,
        views,
    }))
}
