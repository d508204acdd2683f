//! # bf-messaging
//!
//! Runs the Bit-Fever messaging core until Ctrl-C.
//!
//! Configuration comes from the JSON file named by `BF_CONFIG_FILE`, or from
//! `BF_MSG_*` / `BF_LOG_*` environment variables. Any startup failure exits
//! with a non-zero status.

use std::sync::Arc;

use anyhow::{Context, Result};
use bf_bus::BrokerConnector;
use bf_runtime::{MessagingRuntime, RuntimeConfig};
use bf_telemetry::init_logging;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = RuntimeConfig::load().context("Failed to load configuration")?;
    init_logging(&config.logging).context("Failed to initialize logging")?;

    let runtime = MessagingRuntime::start(config, connector())
        .await
        .context("Failed to start messaging")?;

    info!("Messaging is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    runtime.shutdown().await;
    Ok(())
}

#[cfg(feature = "amqp")]
fn connector() -> Arc<dyn BrokerConnector> {
    Arc::new(bf_bus::AmqpConnector::new())
}

#[cfg(not(feature = "amqp"))]
fn connector() -> Arc<dyn BrokerConnector> {
    tracing::warn!("Built without the amqp feature, using the in-process broker");
    Arc::new(bf_bus::InMemoryBroker::new())
}
