//! Core modules shared by ingestion and queries.
//!
//! The catalog, the on-disk layout and the ambient pieces (errors, configuration,
//! logging, audit) live here.

pub mod audit;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod locks;
pub mod logging;
pub mod model;
pub mod schemas;
pub mod store;
pub mod time;
