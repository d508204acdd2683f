//! # Bit-Fever Envelope
//!
//! The generic wire format carried between Bit-Fever services over the broker.
//!
//! ## Design Principles
//!
//! - **Opaque Entity**: the transport never looks inside `entity`; only the
//!   application handler registered for `(source, type)` decodes it.
//! - **Wire Compatibility**: field names and the base64 entity encoding match
//!   the producers already deployed, so mixed fleets interoperate.
//! - **No Schema**: `(source, type)` is the only routing information.
//!
//! ```text
//! {"Origin": 0, "Type": 0, "Source": "inventory", "Entity": "eyJpZCI6MX0="}
//!                                                            └── base64(JSON entity)
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod entities;
pub mod envelope;
pub mod errors;

pub use entities::{Event, EventLevel};
pub use envelope::{decode, encode, Envelope, MessageKind};
pub use errors::EnvelopeError;

/// Content type stamped on every envelope published to the broker.
pub const CONTENT_TYPE: &str = "text/json";
