use crate::core::error::NexusError;
use crate::core::schemas;
use rusqlite::{Connection, params};
use std::path::Path;
use std::time::Duration;

/// Busy timeout for catalog connections. Writers to distinct datasets still share
/// one SQLite file, so a short wait on the write lock is expected.
const BUSY_TIMEOUT_SECS: u64 = 10;

pub fn db_connect(db_path: &Path) -> Result<Connection, NexusError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECS))
        .map_err(NexusError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(NexusError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(NexusError::RusqliteError)?;
    conn.execute("PRAGMA synchronous=FULL;", [])
        .map_err(NexusError::RusqliteError)?;
    Ok(conn)
}

pub fn initialize_catalog_db(db_path: &Path) -> Result<(), NexusError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(NexusError::IoError)?;
    }
    let conn = db_connect(db_path)?;
    for ddl in schemas::CATALOG_DB_SCHEMAS {
        conn.execute(ddl, [])?;
    }
    conn.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES('schema_version', ?1)",
        params![schemas::CATALOG_SCHEMA_VERSION.to_string()],
    )?;

    let version: String = conn.query_row(
        "SELECT value FROM meta WHERE key = 'schema_version'",
        [],
        |row| row.get(0),
    )?;
    if version != schemas::CATALOG_SCHEMA_VERSION.to_string() {
        return Err(NexusError::ValidationError(format!(
            "catalog schema version {} is not supported (expected {})",
            version,
            schemas::CATALOG_SCHEMA_VERSION
        )));
    }
    Ok(())
}

/// Double-quote an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
