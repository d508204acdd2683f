//! Logging configuration from environment variables.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration of the process-wide log subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Service name attached to the startup line.
    pub service_name: String,

    /// Log level filter (trace, debug, info, warn, error) or a full
    /// `EnvFilter` directive.
    pub log_level: String,

    /// Whether to write to stdout.
    pub console_output: bool,

    /// Whether stdout lines are JSON.
    pub json_logs: bool,

    /// Append-only JSON log file, mirrored with stdout.
    pub log_file: Option<PathBuf>,

    /// Forces the `debug` level.
    pub debug: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            service_name: "bf-messaging".to_string(),
            log_level: "info".to_string(),
            console_output: true,
            json_logs: false,
            log_file: None,
            debug: false,
        }
    }
}

impl LoggingConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `BF_SERVICE_NAME`: Service name (default: bf-messaging)
    /// - `BF_LOG_LEVEL` or `RUST_LOG`: Log level (default: info)
    /// - `BF_CONSOLE_OUTPUT`: Enable console output (default: true)
    /// - `BF_JSON_LOGS`: JSON console lines (default: false, true in containers)
    /// - `BF_LOG_FILE`: Path of the JSON log file (default: none)
    /// - `BF_DEBUG`: Force debug level (default: false)
    pub fn from_env() -> Self {
        let is_container =
            env::var("KUBERNETES_SERVICE_HOST").is_ok() || env::var("DOCKER_CONTAINER").is_ok();

        Self {
            service_name: env::var("BF_SERVICE_NAME")
                .unwrap_or_else(|_| "bf-messaging".to_string()),

            log_level: env::var("BF_LOG_LEVEL")
                .or_else(|_| env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),

            console_output: env::var("BF_CONSOLE_OUTPUT")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(true),

            json_logs: env::var("BF_JSON_LOGS")
                .map(|v| flag(&v))
                .unwrap_or(is_container),

            log_file: env::var("BF_LOG_FILE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),

            debug: env::var("BF_DEBUG").map(|v| flag(&v)).unwrap_or(false),
        }
    }

    /// Filter directive actually applied.
    #[must_use]
    pub fn effective_level(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log_level
        }
    }
}

fn flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}
