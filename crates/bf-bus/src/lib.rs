//! # Bit-Fever Bus - Reliable Publish/Subscribe over a Broker
//!
//! Reliability layer between Bit-Fever services and a fanout / durable-queue /
//! manual-ack broker (AMQP 0-9-1).
//!
//! ## Components
//!
//! - [`ConnectionSupervisor`]: the single shared link; serializes writes and
//!   reconnects once on demand.
//! - [`topology`]: idempotent declaration of exchanges, queues and bindings.
//! - [`Publisher`]: entity → envelope → broker, under a deadline.
//! - [`Consumer`]: per-queue loop with ack / requeue / dead-letter settlement.
//! - [`DispatchTable`]: typed handlers by `(source, kind)`.
//!
//! ```text
//!  Publisher ──send()──→ [exchange: fanout] ──┬──→ [queue A] ──→ Consumer A
//!                                             └──→ [queue B] ──→ Consumer B
//!                                                                  │
//!                                    over retry bound ──→ [dead-letter exchange]
//! ```
//!
//! ## Delivery Guarantees
//!
//! - At-least-once: a message leaves a queue only when acknowledged.
//! - No ordering across queues; requeued messages carry no position
//!   guarantee.
//! - Poison messages (not an envelope) are discarded, never retried.

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

use std::time::Duration;

pub mod adapters;
pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod ports;
pub mod publisher;
pub mod retry;
pub mod supervisor;
pub mod topology;

pub use adapters::InMemoryBroker;
#[cfg(feature = "amqp")]
pub use adapters::AmqpConnector;
pub use config::{BrokerSettings, ConfigError, MessagingConfig};
pub use consumer::{Consumer, ConsumerStats};
pub use dispatch::{handler_fn, DispatchTable, DispatchTableBuilder, EnvelopeHandler, Verdict};
pub use error::{
    BrokerError, ConnectivityError, ConsumeError, DispatchError, PublishError, TopologyError,
};
pub use ports::{BrokerChannel, BrokerConnector, Delivery, Publication};
pub use publisher::{MessagePublisher, Publisher, RecordingPublisher};
pub use retry::{RetryDecision, RetryLedger, RetryPolicy};
pub use supervisor::{ConnectionSupervisor, LinkGuard, LinkState};
pub use topology::{queue_name, Topology, TopologyBuilder};

/// Default deadline of a single publish.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of handler rejections before a message is dead-lettered.
pub const DEFAULT_MAX_REDELIVERIES: u32 = 5;

/// Default number of unacknowledged deliveries per subscription.
pub const DEFAULT_PREFETCH_COUNT: u16 = 10;

/// Default dead-letter exchange.
pub const DEAD_LETTER_EXCHANGE: &str = "bf.dead.letter";
