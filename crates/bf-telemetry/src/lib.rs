//! # Bit-Fever Telemetry
//!
//! Structured logging for Bit-Fever services, built on `tracing-subscriber`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bf_telemetry::{init_logging, LoggingConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LoggingConfig::from_env())?;
//!     tracing::info!("ready");
//!     Ok(())
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `BF_LOG_LEVEL` / `RUST_LOG` | `info` | Filter directive |
//! | `BF_JSON_LOGS` | `false` | JSON console lines |
//! | `BF_LOG_FILE` | unset | Append-only JSON log file |
//! | `BF_DEBUG` | `false` | Force debug level |

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod config;
mod logging;

use std::path::PathBuf;

pub use config::LoggingConfig;
pub use logging::{build_filter, init_logging};

use thiserror::Error;

/// Logging initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("invalid log filter '{directive}': {reason}")]
    Filter { directive: String, reason: String },

    #[error("cannot open log file {}: {source}", path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("a global subscriber is already installed: {0}")]
    AlreadyInitialized(String),
}
