//! # Error Types
//!
//! Errors raised while turning entities into envelopes and back.

use thiserror::Error;

/// Errors from the envelope protocol.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The entity cannot be represented on the wire. Nothing is sent.
    #[error("cannot serialize entity: {0}")]
    Serialization(#[source] serde_json::Error),

    /// Inbound bytes are not a valid envelope (poison message).
    #[error("malformed envelope: {0}")]
    Decode(#[source] serde_json::Error),

    /// The envelope is well formed but its entity does not match the type
    /// the application expects for this `(source, type)` tag.
    #[error("entity of {origin}/{kind} does not decode: {cause}")]
    Entity {
        origin: String,
        kind: i32,
        #[source]
        cause: serde_json::Error,
    },
}

impl EnvelopeError {
    /// Returns true if the error concerns inbound bytes rather than an
    /// outbound entity.
    #[must_use]
    pub fn is_inbound(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::Entity { .. })
    }
}
