//! Canned queries: registry, snapshot materialization, execution and scoring.

pub mod deadline;
pub mod executor;
pub mod registry;
pub mod scoring;
pub mod snapshot;
