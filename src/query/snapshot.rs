//! Query snapshots.
//!
//! A snapshot is one committed catalog entry, read at a single instant, loaded
//! into a private in-memory SQLite database as a table named after the view.
//! Chunks committed after the entry was read are not part of it. The connection
//! is switched to `query_only` once loaded. Loading runs under the caller's
//! `Deadline`, so a large view cannot outlast the query timeout.

use crate::core::catalog::{Catalog, CatalogEntry};
use crate::core::db::quote_ident;
use crate::core::error::NexusError;
use crate::core::model::{FieldType, LINE_COLUMN, Schema};
use crate::ingest::chunk::{self, DecodedRow};
use crate::query::deadline::Deadline;
use rayon::prelude::*;
use rusqlite::{Connection, params_from_iter};
use rustc_hash::FxHashSet;
use sha2::{Digest, Sha256};

/// Rows inserted between deadline checks.
const DEADLINE_CHECK_ROWS: usize = 1024;

pub struct Snapshot {
    entry: CatalogEntry,
    view: String,
    /// SQL column name for each schema field, in schema order.
    columns: Vec<String>,
    conn: Connection,
}

impl Snapshot {
    /// Resolve `view` and materialize the entry it points at.
    pub fn open(catalog: &Catalog, view: &str) -> Result<Self, NexusError> {
        Self::open_within(catalog, view, &Deadline::unbounded("snapshot"))
    }

    /// Like `open`, failing with `QueryTimeout` once `deadline` is spent.
    pub fn open_within(
        catalog: &Catalog,
        view: &str,
        deadline: &Deadline,
    ) -> Result<Self, NexusError> {
        let entry = catalog
            .resolve_view(view)?
            .ok_or_else(|| NexusError::NotFound(format!("view '{view}'")))?;
        deadline.check()?;
        Self::materialize(catalog, entry, view, deadline)
    }

    fn materialize(
        catalog: &Catalog,
        entry: CatalogEntry,
        view: &str,
        deadline: &Deadline,
    ) -> Result<Self, NexusError> {
        let columns = sql_column_names(&entry.schema);
        let conn = Connection::open_in_memory()?;

        let mut ddl = format!("CREATE TABLE {} ({} INTEGER", quote_ident(view), quote_ident(LINE_COLUMN));
        for (field, column) in entry.schema.fields().iter().zip(&columns) {
            ddl.push_str(", ");
            ddl.push_str(&quote_ident(column));
            let affinity = field.field_type.sql_affinity();
            if !affinity.is_empty() {
                ddl.push(' ');
                ddl.push_str(affinity);
            }
        }
        ddl.push(')');
        conn.execute(&ddl, [])?;

        let data_dir = catalog.data_dir();
        let decoded: Vec<Vec<DecodedRow>> = entry
            .chunks
            .par_iter()
            .map(|c| {
                let path = data_dir.chunk_path(&entry.dataset_id, c.seq);
                deadline.check()?;
                verify_chunk(&path, &c.content_sha256)?;
                deadline.check()?;
                chunk::decode_chunk(&path, &entry.schema)
            })
            .collect::<Result<_, NexusError>>()?;

        let placeholders = vec!["?"; columns.len() + 1].join(", ");
        let insert = format!("INSERT INTO {} VALUES ({})", quote_ident(view), placeholders);
        let watchdog = deadline.watch(conn.get_interrupt_handle());
        let loaded = (|| -> Result<bool, rusqlite::Error> {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(&insert)?;
                for (i, row) in decoded.iter().flatten().enumerate() {
                    if i % DEADLINE_CHECK_ROWS == 0 && deadline.expired() {
                        return Ok(false);
                    }
                    let values = std::iter::once(rusqlite::types::Value::Integer(row.line as i64))
                        .chain(row.values.iter().map(|v| v.to_sql()));
                    stmt.execute(params_from_iter(values))?;
                }
            }
            tx.commit()?;
            Ok(true)
        })();
        let fired = watchdog.disarm();
        match loaded {
            Ok(true) => {}
            Ok(false) => return Err(deadline.timeout_error()),
            Err(e) => return Err(deadline.classify(fired, e)?.into()),
        }
        conn.execute_batch("PRAGMA query_only = ON;")?;

        tracing::debug!(
            dataset_id = %entry.dataset_id,
            view,
            chunks = entry.chunks.len(),
            rows = entry.row_count,
            "snapshot materialized"
        );
        Ok(Self {
            entry,
            view: view.to_string(),
            columns,
            conn,
        })
    }

    pub fn entry(&self) -> &CatalogEntry {
        &self.entry
    }

    pub fn schema(&self) -> &Schema {
        &self.entry.schema
    }

    pub fn view(&self) -> &str {
        &self.view
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn total_rows(&self) -> u64 {
        self.entry.row_count
    }

    /// SQL column backing the schema field `name`.
    pub fn column_for(&self, name: &str) -> Option<&str> {
        self.entry
            .schema
            .fields()
            .iter()
            .position(|f| f.name == name)
            .map(|i| self.columns[i].as_str())
    }

    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.entry.schema.get(name)
    }
}

/// SQLite column names are case-insensitive; later fields that collide with an
/// earlier one get a numeric suffix.
fn sql_column_names(schema: &Schema) -> Vec<String> {
    let mut seen: FxHashSet<String> = FxHashSet::default();
    seen.insert(LINE_COLUMN.to_string());
    let mut out = Vec::with_capacity(schema.len());
    for field in schema.fields() {
        let mut candidate = field.name.clone();
        let mut n = 2;
        while !seen.insert(candidate.to_lowercase()) {
            candidate = format!("{}_{}", field.name, n);
            n += 1;
        }
        out.push(candidate);
    }
    out
}

fn verify_chunk(path: &std::path::Path, expected_sha256: &str) -> Result<(), NexusError> {
    let bytes = std::fs::read(path).map_err(NexusError::IoError)?;
    let actual = format!("{:x}", Sha256::digest(&bytes));
    if actual != expected_sha256 {
        return Err(NexusError::ValidationError(format!(
            "chunk {} does not match its recorded checksum",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{FieldType, FieldValue, Row};
    use crate::core::store::DataDir;
    use crate::ingest::writer::ChunkWriter;

    fn seeded() -> (tempfile::TempDir, Catalog) {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&DataDir::new(tmp.path())).unwrap();
        let mut schema = Schema::new();
        schema.set("status", FieldType::Integer);
        schema.set("Status", FieldType::String);

        let mut w = ChunkWriter::new(catalog.data_dir(), "web", 0, 2).unwrap();
        for (line, code) in [(1, 200), (2, 404), (3, 200)] {
            let mut row = Row::default();
            row.insert("status".to_string(), FieldValue::Int(code));
            w.push(line, row, &schema).unwrap();
        }
        let chunks = w.finish(&schema).unwrap();
        catalog.commit("web", &chunks, &schema, Some("logs")).unwrap();
        (tmp, catalog)
    }

    #[test]
    fn loads_all_committed_rows_in_order() {
        let (_tmp, catalog) = seeded();
        let snap = Snapshot::open(&catalog, "logs").unwrap();
        assert_eq!(snap.total_rows(), 3);
        let lines: Vec<i64> = snap
            .connection()
            .prepare("SELECT \"_line\" FROM \"logs\" ORDER BY rowid")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(lines, vec![1, 2, 3]);
        assert_eq!(snap.column_for("status"), Some("status"));
        assert_eq!(snap.column_for("Status"), Some("Status_2"));
    }

    #[test]
    fn snapshot_is_read_only() {
        let (_tmp, catalog) = seeded();
        let snap = Snapshot::open(&catalog, "logs").unwrap();
        assert!(snap
            .connection()
            .execute("DELETE FROM \"logs\"", [])
            .is_err());
    }

    #[test]
    fn tampered_chunk_is_rejected() {
        let (_tmp, catalog) = seeded();
        std::fs::write(catalog.data_dir().chunk_path("web", 1), b"garbage").unwrap();
        assert!(matches!(
            Snapshot::open(&catalog, "logs"),
            Err(NexusError::ValidationError(_))
        ));
    }

    #[test]
    fn spent_deadline_stops_materialization() {
        let (_tmp, catalog) = seeded();
        let deadline = Deadline::start("total_requests", std::time::Duration::ZERO);
        match Snapshot::open_within(&catalog, "logs", &deadline) {
            Err(NexusError::QueryTimeout { query, timeout_ms }) => {
                assert_eq!(query, "total_requests");
                assert_eq!(timeout_ms, 0);
            }
            Err(e) => panic!("expected timeout, got {e}"),
            Ok(_) => panic!("expected timeout, got a snapshot"),
        }
    }

    #[test]
    fn unknown_view_is_not_found() {
        let (_tmp, catalog) = seeded();
        assert!(matches!(
            Snapshot::open(&catalog, "nope"),
            Err(NexusError::NotFound(_))
        ));
    }
}
