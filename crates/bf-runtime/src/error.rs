//! Runtime errors.
//!
//! Everything here is a startup failure; the binary exits non-zero on any
//! of them.

use std::path::PathBuf;

use bf_bus::{ConfigError, ConnectivityError, DispatchError, TopologyError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot read config file {}: {cause}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        cause: std::io::Error,
    },

    #[error("cannot parse config file {}: {cause}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        cause: serde_json::Error,
    },

    #[error("failed to connect to the messaging system: {0}")]
    Connectivity(#[from] ConnectivityError),

    #[error("failed to declare the messaging topology: {0}")]
    Topology(#[from] TopologyError),

    #[error("invalid dispatch table: {0}")]
    Dispatch(#[from] DispatchError),
}
