//! # Message Envelope
//!
//! The universal wrapper for every message published to the broker.
//!
//! ## Properties
//!
//! - **Tagging**: `source` names the producing subsystem, `kind` the
//!   operation (create/update/delete/...). Together they select the handler.
//! - **Opaque Payload**: `entity` holds the JSON encoding of the application
//!   entity. It is base64 on the wire and never parsed by the transport.
//! - **Origin**: numeric origin tag kept for compatibility with older
//!   producers. Optional on decode.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_with::base64::Base64;
use serde_with::serde_as;

use crate::errors::EnvelopeError;

/// Operation tag carried by an envelope.
///
/// Serialized as a small integer. Values outside the well-known set survive
/// a round trip as [`MessageKind::Custom`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum MessageKind {
    /// An entity was created.
    Create,
    /// An entity was updated.
    Update,
    /// An entity was deleted.
    Delete,
    /// Application-defined tag.
    Custom(i32),
}

impl MessageKind {
    /// The integer written on the wire.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Create => 0,
            Self::Update => 1,
            Self::Delete => 2,
            Self::Custom(code) => code,
        }
    }
}

impl From<i32> for MessageKind {
    fn from(code: i32) -> Self {
        match code {
            0 => Self::Create,
            1 => Self::Update,
            2 => Self::Delete,
            other => Self::Custom(other),
        }
    }
}

impl From<MessageKind> for i32 {
    fn from(kind: MessageKind) -> Self {
        kind.code()
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::Custom(code) => write!(f, "custom({code})"),
        }
    }
}

/// A decoded message: routing tags plus the still-encoded entity.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Numeric origin tag (legacy producers). Defaults to 0.
    #[serde(rename = "Origin", alias = "origin", default)]
    pub origin: i32,

    /// Operation tag.
    #[serde(rename = "Type", alias = "type")]
    pub kind: MessageKind,

    /// Producing subsystem.
    #[serde(rename = "Source", alias = "source")]
    pub source: String,

    /// JSON encoding of the entity. Opaque to the transport.
    #[serde_as(as = "Base64")]
    #[serde(rename = "Entity", alias = "entity")]
    pub entity: Vec<u8>,
}

impl Envelope {
    /// Wrap an entity, serializing it to JSON.
    ///
    /// # Errors
    ///
    /// `EnvelopeError::Serialization` if the entity cannot be represented.
    pub fn wrap<T>(source: &str, kind: MessageKind, entity: &T) -> Result<Self, EnvelopeError>
    where
        T: Serialize + ?Sized,
    {
        let entity = serde_json::to_vec(entity).map_err(EnvelopeError::Serialization)?;
        Ok(Self {
            origin: 0,
            kind,
            source: source.to_string(),
            entity,
        })
    }

    /// Set the legacy origin tag.
    #[must_use]
    pub fn with_origin(mut self, origin: i32) -> Self {
        self.origin = origin;
        self
    }

    /// Serialize the envelope to its wire bytes.
    ///
    /// # Errors
    ///
    /// `EnvelopeError::Serialization` (cannot happen for a well-formed
    /// envelope, but the encoder is fallible).
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Serialization)
    }

    /// Parse wire bytes. The entity is left untouched.
    ///
    /// # Errors
    ///
    /// `EnvelopeError::Decode` if the bytes are not an envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(EnvelopeError::Decode)
    }

    /// Decode the entity into the type the application expects for this tag.
    ///
    /// # Errors
    ///
    /// `EnvelopeError::Entity` if the payload does not match `T`.
    pub fn entity_as<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_slice(&self.entity).map_err(|cause| EnvelopeError::Entity {
            origin: self.source.clone(),
            kind: self.kind.code(),
            cause,
        })
    }

    /// The `(source, kind)` routing tag.
    #[must_use]
    pub fn tag(&self) -> (&str, MessageKind) {
        (&self.source, self.kind)
    }
}

/// Encode an entity into envelope wire bytes.
///
/// # Errors
///
/// `EnvelopeError::Serialization` if the entity cannot be represented.
pub fn encode<T>(source: &str, kind: MessageKind, entity: &T) -> Result<Vec<u8>, EnvelopeError>
where
    T: Serialize + ?Sized,
{
    Envelope::wrap(source, kind, entity)?.to_bytes()
}

/// Decode envelope wire bytes without touching the entity.
///
/// # Errors
///
/// `EnvelopeError::Decode` if the bytes are not an envelope.
pub fn decode(bytes: &[u8]) -> Result<Envelope, EnvelopeError> {
    Envelope::from_bytes(bytes)
}
