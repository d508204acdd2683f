//! # Bit-Fever Messaging Runtime
//!
//! Hosts the messaging core for one process: configuration, the application
//! topology, event helpers and the consumer loops of the standard queues.
//!
//! ## Modules
//!
//! - `config` - runtime configuration (JSON file or environment)
//! - `topology` - exchanges and queues every Bit-Fever service agrees on
//! - `events` - user-facing events on `bf.system.events`
//! - `handlers` - handlers behind the standard queues
//! - `runtime` - startup and shutdown sequence
//!
//! ## Startup Sequence
//!
//! ```text
//! load config → init logging → validate
//!     → connect (fatal) → declare topology (fatal)
//!     → spawn consumer loops → ... → shutdown → await loops → close link
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod runtime;
pub mod topology;

pub use config::RuntimeConfig;
pub use error::RuntimeError;
pub use events::EventSender;
pub use handlers::{DeadLetter, DeadLetterStore};
pub use runtime::MessagingRuntime;
