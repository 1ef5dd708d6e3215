use lognexus::core::audit::{AuditEvent, AuditSink, JsonlAuditSink};
use lognexus::core::catalog::{Catalog, ChunkRecord};
use lognexus::core::config::NexusConfig;
use lognexus::core::db;
use lognexus::core::error::NexusError;
use lognexus::core::locks::DatasetLocks;
use lognexus::core::model::{FieldType, Schema};
use lognexus::core::schemas;
use lognexus::core::store::{self, DataDir};
use lognexus::ingest::infer::NumericWidening;
use rusqlite::params;
use std::fs;
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn chunk(seq: u64, rows: u64) -> ChunkRecord {
    ChunkRecord {
        seq,
        file_name: store::chunk_file_name(seq),
        row_count: rows,
        content_sha256: "0".repeat(64),
        created_at: "0Z".to_string(),
    }
}

#[test]
fn catalog_database_is_hardened_and_versioned() {
    let tmp = tempdir().expect("tempdir");
    let dir = DataDir::new(tmp.path());
    let _catalog = Catalog::open(&dir).expect("open catalog");

    let db_path = dir.catalog_path();
    assert!(db_path.ends_with("duckdb/catalog.db"));
    assert!(dir.root.join("parquet").is_dir());

    let conn = db::db_connect(&db_path).expect("db connect");
    let journal: String = conn
        .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
        .expect("pragma journal_mode");
    assert_eq!(journal.to_lowercase(), "wal");
    let fk_on: i64 = conn
        .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
        .expect("pragma foreign_keys");
    assert_eq!(fk_on, 1);

    let version: String = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .expect("schema version");
    assert_eq!(version, schemas::CATALOG_SCHEMA_VERSION.to_string());

    // Re-opening is idempotent.
    Catalog::open(&dir).expect("reopen");

    conn.execute(
        "UPDATE meta SET value = ?1 WHERE key = 'schema_version'",
        params!["99"],
    )
    .expect("bump version");
    assert!(matches!(
        Catalog::open(&dir),
        Err(NexusError::ValidationError(_))
    ));
}

#[test]
fn catalog_rows_match_api_view() {
    let tmp = tempdir().expect("tempdir");
    let catalog = Catalog::open(&DataDir::new(tmp.path())).expect("open catalog");

    let mut schema = Schema::new();
    schema.set("status", FieldType::Integer);
    schema.set("path", FieldType::String);
    let entry = catalog
        .commit("web", &[chunk(0, 3), chunk(1, 2)], &schema, Some("logs"))
        .expect("commit");
    assert_eq!(entry.row_count, 5);
    assert_eq!(entry.views, vec!["logs".to_string()]);

    let conn = rusqlite::Connection::open(catalog.db_path()).expect("raw connect");
    let (schema_json, rows): (String, i64) = conn
        .query_row(
            "SELECT schema_json, row_count FROM datasets WHERE id = 'web'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .expect("dataset row");
    assert_eq!(rows, 5);
    let stored: serde_json::Value = serde_json::from_str(&schema_json).expect("schema json");
    assert_eq!(
        stored,
        serde_json::json!([
            {"name": "status", "type": "integer"},
            {"name": "path", "type": "string"}
        ])
    );

    let files: Vec<String> = conn
        .prepare("SELECT file_name FROM chunks WHERE dataset_id = 'web' ORDER BY seq")
        .expect("prepare")
        .query_map([], |r| r.get(0))
        .expect("query")
        .collect::<Result<_, _>>()
        .expect("rows");
    assert_eq!(files, vec!["0.parquet", "1.parquet"]);

    let view_target: String = conn
        .query_row(
            "SELECT dataset_id FROM views WHERE view_name = 'logs'",
            [],
            |r| r.get(0),
        )
        .expect("view row");
    assert_eq!(view_target, "web");
}

#[test]
fn config_file_is_loaded_and_validated() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("lognexus.toml");
    fs::write(
        &path,
        format!(
            "data_dir = {:?}\nchunk_size = 250\nquery_timeout_ms = 500\nnumeric_widening = \"string\"\nlog_level = \"warn\"\n",
            tmp.path().join("data")
        ),
    )
    .expect("write config");

    let config = NexusConfig::load(&path).expect("load");
    assert_eq!(config.chunk_size, 250);
    assert_eq!(config.default_view, "logs");
    assert_eq!(config.query_timeout(), Duration::from_millis(500));
    assert_eq!(config.numeric_widening, NumericWidening::String);
    assert_eq!(config.log_level.as_deref(), Some("warn"));
    assert_eq!(config.data_dir().root, tmp.path().join("data"));

    assert!(matches!(
        NexusConfig::load(&tmp.path().join("missing.toml")),
        Err(NexusError::ConfigError(_))
    ));
    fs::write(&path, "chunk_size = \"many\"\n").expect("write config");
    assert!(matches!(
        NexusConfig::load(&path),
        Err(NexusError::ConfigError(_))
    ));
}

#[test]
fn dataset_locks_allow_parallel_writers_on_different_ids() {
    let locks = Arc::new(DatasetLocks::new());
    let barrier = Arc::new(Barrier::new(3));

    let handles: Vec<_> = ["a", "b"]
        .into_iter()
        .map(|id| {
            let locks = Arc::clone(&locks);
            let gate = Arc::clone(&barrier);
            std::thread::spawn(move || {
                locks.with_write(id, || {
                    gate.wait();
                    std::thread::sleep(Duration::from_millis(150));
                    Ok(())
                })
            })
        })
        .collect();

    barrier.wait();
    let started = Instant::now();
    for h in handles {
        h.join().expect("thread joined").expect("writer ok");
    }
    let elapsed = started.elapsed();
    assert!(
        elapsed < Duration::from_millis(260),
        "expected per-dataset concurrency (<260ms), got {:?}",
        elapsed
    );
}

#[test]
fn jsonl_audit_log_lives_in_data_dir() {
    let tmp = tempdir().expect("tempdir");
    let dir = DataDir::new(tmp.path());
    let sink = JsonlAuditSink::new(&dir.audit_log_path());
    for success in [true, false] {
        sink.emit(&AuditEvent::new(
            "query",
            "canned:total_requests",
            "logs",
            success,
            serde_json::json!({}),
        ))
        .expect("emit");
    }

    let content = fs::read_to_string(tmp.path().join("audit.log")).expect("audit log");
    let events: Vec<AuditEvent> = content
        .lines()
        .map(|l| serde_json::from_str(l).expect("event json"))
        .collect();
    assert_eq!(events.len(), 2);
    assert_ne!(events[0].event_id, events[1].event_id);
    assert!(events[0].ts.ends_with('Z'));
}
