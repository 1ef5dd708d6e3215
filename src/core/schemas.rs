//! Catalog database schema definitions.
//!
//! The catalog is a single SQLite file holding three tables:
//! 1. datasets: identity, current schema (JSON), row count, timestamps.
//! 2. chunks: one row per committed, fully persisted chunk file.
//! 3. views: queryable names, each bound to exactly one dataset.

pub const CATALOG_SCHEMA_VERSION: u32 = 1;

pub const CATALOG_DB_SCHEMA_META: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
";

pub const CATALOG_DB_SCHEMA_DATASETS: &str = "
    CREATE TABLE IF NOT EXISTS datasets (
        id TEXT PRIMARY KEY,
        schema_json TEXT NOT NULL,
        row_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
";

pub const CATALOG_DB_SCHEMA_CHUNKS: &str = "
    CREATE TABLE IF NOT EXISTS chunks (
        dataset_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        file_name TEXT NOT NULL,
        row_count INTEGER NOT NULL,
        content_sha256 TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY(dataset_id, seq),
        FOREIGN KEY(dataset_id) REFERENCES datasets(id)
    )
";

pub const CATALOG_DB_SCHEMA_VIEWS: &str = "
    CREATE TABLE IF NOT EXISTS views (
        view_name TEXT PRIMARY KEY,
        dataset_id TEXT NOT NULL,
        registered_at TEXT NOT NULL,
        FOREIGN KEY(dataset_id) REFERENCES datasets(id)
    )
";

pub const CATALOG_DB_SCHEMA_VIEWS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_views_dataset ON views(dataset_id)";

pub const CATALOG_DB_SCHEMAS: &[&str] = &[
    CATALOG_DB_SCHEMA_META,
    CATALOG_DB_SCHEMA_DATASETS,
    CATALOG_DB_SCHEMA_CHUNKS,
    CATALOG_DB_SCHEMA_VIEWS,
    CATALOG_DB_SCHEMA_VIEWS_INDEX,
];
