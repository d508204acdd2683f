//! Runtime configuration.
//!
//! Read from the JSON file named by `BF_CONFIG_FILE` when set, otherwise
//! from environment variables. Missing keys take their defaults, so a file
//! only needs the values it changes:
//!
//! ```json
//! {
//!   "messaging": { "broker": { "address": "rabbit:5672" } },
//!   "logging": { "log_file": "/var/log/bf/messaging.log" }
//! }
//! ```

use std::env;
use std::fs;
use std::path::Path;

use bf_bus::{ConfigError, MessagingConfig};
use bf_telemetry::LoggingConfig;
use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;
use crate::topology::RETRYING_EXCHANGES;

/// Environment variable naming the JSON configuration file.
pub const CONFIG_FILE_VAR: &str = "BF_CONFIG_FILE";

/// Complete configuration of the `bf-messaging` process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub messaging: MessagingConfig,
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    /// File named by `BF_CONFIG_FILE`, or the environment.
    ///
    /// # Errors
    ///
    /// `RuntimeError` if the file cannot be read or parsed, or an
    /// environment variable holds an invalid value.
    pub fn load() -> Result<Self, RuntimeError> {
        match env::var(CONFIG_FILE_VAR) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim()),
            _ => Self::from_env(),
        }
    }

    /// # Errors
    ///
    /// `RuntimeError::Config` if a numeric variable does not parse.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Ok(Self {
            messaging: MessagingConfig::from_env()?,
            logging: LoggingConfig::from_env(),
        })
    }

    /// # Errors
    ///
    /// `ConfigRead` or `ConfigParse` naming the file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|cause| RuntimeError::ConfigRead {
            path: path.to_path_buf(),
            cause,
        })?;
        serde_json::from_str(&raw).map_err(|cause| RuntimeError::ConfigParse {
            path: path.to_path_buf(),
            cause,
        })
    }

    /// # Errors
    ///
    /// The first invalid messaging setting, or `DeadLetterLoop` when the
    /// dead-letter exchange is one of [`RETRYING_EXCHANGES`].
    pub fn validate(&self) -> Result<(), RuntimeError> {
        self.messaging.validate()?;
        if let Some(exchange) = &self.messaging.dead_letter_exchange {
            if RETRYING_EXCHANGES.contains(&exchange.as_str()) {
                return Err(ConfigError::DeadLetterLoop(exchange.clone()).into());
            }
        }
        Ok(())
    }
}
