//! Ingestion: NDJSON lines in, schema-evolving Parquet chunks and a catalog commit out.

pub mod chunk;
pub mod infer;
pub mod job;
pub mod writer;
