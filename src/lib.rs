//! Poll ballot intake and aggregation core
//!
//! Commit freezes a poll's definition; the eligibility gate opens ballots;
//! submission records votes exactly once; statistics are computed from the
//! vote rows and pushed to live viewers over an in-process bus.

pub mod ballot;
pub mod config;
pub mod crypto;
pub mod draft;
pub mod eligibility;
pub mod engine;
pub mod errors;
pub mod freeze;
pub mod maintenance;
pub mod realtime;
pub mod stats;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use engine::PollEngine;
pub use errors::{Error, ErrorKind, Result};

use config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging from `RUST_LOG`, defaulting to `ballotbox=info`
pub fn init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "ballotbox=info".into()),
        )
        .try_init()
        .map_err(|e| Error::internal(format!("Logging already initialized: {e}")))?;

    tracing::info!("ballotbox v{} initialized", VERSION);
    Ok(())
}

/// Initialize logging with an explicit level and `json` or `pretty` output
pub fn init_with(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(format!("ballotbox={}", logging.level))
        .map_err(|e| Error::internal(format!("Invalid log level: {e}")))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match logging.format.as_str() {
        "json" => builder.json().try_init(),
        "pretty" => builder.pretty().try_init(),
        _ => builder.try_init(),
    };
    installed.map_err(|e| Error::internal(format!("Logging already initialized: {e}")))?;

    tracing::info!(format = %logging.format, "ballotbox v{} initialized", VERSION);
    Ok(())
}
