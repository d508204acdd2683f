//! Subscriber assembly.
//!
//! One `EnvFilter` in front of up to two fmt layers:
//! - stdout, pretty for development or JSON in containers
//! - an append-only JSON file, when configured

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing::Subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::{LoggingConfig, TelemetryError};

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;

/// Install the global subscriber described by `config`.
///
/// # Errors
///
/// `TelemetryError` if the filter does not parse, the log file cannot be
/// opened, or a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let filter = build_filter(config)?;
    let file = config.log_file.as_deref().map(open_log_file).transpose()?;

    let console = config.console_output.then(|| console_layer(config.json_logs));
    let file_layer = file.map(file_layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))?;

    tracing::info!(
        service = %config.service_name,
        level = %config.effective_level(),
        json = config.json_logs,
        log_file = ?config.log_file,
        "Logging initialized"
    );
    Ok(())
}

/// Filter from the configured level.
///
/// # Errors
///
/// `TelemetryError::Filter` if the directive does not parse.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_new(config.effective_level()).map_err(|e| TelemetryError::Filter {
        directive: config.effective_level().to_string(),
        reason: e.to_string(),
    })
}

fn open_log_file(path: &Path) -> Result<File, TelemetryError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| TelemetryError::LogFile {
            path: path.to_path_buf(),
            source,
        })
}

fn console_layer<S>(json: bool) -> BoxedLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    if json {
        fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    } else {
        fmt::layer().with_target(true).with_ansi(true).boxed()
    }
}

fn file_layer<S>(file: File) -> BoxedLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .json()
        .with_ansi(false)
        .with_target(true)
        .with_writer(Mutex::new(file))
        .boxed()
}
