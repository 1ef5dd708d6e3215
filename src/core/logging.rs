//! Logging setup for the `lognexus` binary.
//!
//! Priority: `RUST_LOG` > `--debug` > config `log_level` > `info`.
//! Output goes to stderr so stdout stays clean JSON.

use crate::core::config::DEFAULT_LOG_LEVEL;
use tracing_subscriber::EnvFilter;

pub fn init(debug_flag: bool, config_level: Option<&str>) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if debug_flag {
        EnvFilter::new("debug")
    } else if let Some(level) = config_level {
        EnvFilter::new(level)
    } else {
        EnvFilter::new(DEFAULT_LOG_LEVEL)
    };

    // try_init: embedders (and tests) may already have installed a subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .try_init();

    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "logging initialised");
}
