//! CLI struct definitions for the `lognexus` command-line interface.
//!
//! All clap-derived types live here. Dispatch lives in `lib.rs`.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "lognexus",
    version = env!("CARGO_PKG_VERSION"),
    about = "Ingest NDJSON logs into schema-evolving Parquet datasets and answer canned questions about them, with evidence and confidence."
)]
pub(crate) struct Cli {
    /// TOML configuration file.
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,
    /// Data directory (overrides the configuration file).
    #[clap(long, global = true)]
    pub data_dir: Option<PathBuf>,
    /// Enable debug logging (RUST_LOG takes precedence).
    #[clap(long, global = true)]
    pub debug: bool,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Ingest one NDJSON file (or `-` for stdin) into a dataset
    Ingest {
        /// Input file, or `-` to read standard input
        input: PathBuf,
        /// Target dataset id (derived from the input name when omitted)
        #[clap(long)]
        dataset: Option<String>,
        /// View to register the dataset under (configured default when omitted)
        #[clap(long)]
        view: Option<String>,
        #[clap(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Run a canned query
    Query {
        /// Registered query name (see `lognexus queries`)
        name: String,
        /// Parameter as `key=value`; values that parse as JSON are passed typed
        #[clap(long = "param", short = 'p')]
        params: Vec<String>,
        #[clap(long)]
        view: Option<String>,
        #[clap(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Run one read-only SQL statement against a view snapshot
    Raw {
        sql: String,
        #[clap(long)]
        view: Option<String>,
        #[clap(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Point a view name at a dataset
    View {
        dataset: String,
        view: String,
    },
    /// List datasets in the catalog
    Datasets {
        #[clap(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// List registered canned queries
    Queries {
        #[clap(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}
