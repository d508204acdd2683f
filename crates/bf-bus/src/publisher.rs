//! # Publisher
//!
//! Wraps application entities in an [`Envelope`] and publishes them to a
//! fanout exchange through the supervised link.
//!
//! Every publish:
//! 1. encodes the entity; an encoding failure returns before any network call
//! 2. checks the exchange against the declared topology, if one was given
//! 3. takes the supervisor gate, reconnecting once if the link is dead
//! 4. publishes with an empty routing key under the configured deadline
//!
//! A publish to a missing exchange closes the channel every consumer loop
//! shares, so undeclared exchanges never reach the broker.
//!
//! There is no local buffering. A failed publish is reported to the caller
//! and never terminates the process.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bf_envelope::{Envelope, EnvelopeError, MessageKind};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::PublishError;
use crate::ports::Publication;
use crate::supervisor::ConnectionSupervisor;
use crate::topology::Topology;
use crate::DEFAULT_PUBLISH_TIMEOUT;

/// Publishing side of the bus.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publish an already built envelope to `exchange`.
    async fn send_envelope(&self, exchange: &str, envelope: Envelope) -> Result<(), PublishError>;
}

/// Publishes through a [`ConnectionSupervisor`].
#[derive(Debug, Clone)]
pub struct Publisher {
    supervisor: Arc<ConnectionSupervisor>,
    timeout: Duration,
    /// `None` accepts any exchange.
    exchanges: Option<Arc<HashSet<String>>>,
}

impl Publisher {
    /// Publisher with the default 30 second deadline.
    #[must_use]
    pub fn new(supervisor: Arc<ConnectionSupervisor>) -> Self {
        Self {
            supervisor,
            timeout: DEFAULT_PUBLISH_TIMEOUT,
            exchanges: None,
        }
    }

    /// Only publish to exchanges declared by `topology`.
    #[must_use]
    pub fn with_topology(mut self, topology: &Topology) -> Self {
        let names = topology.exchanges().iter().map(|e| e.name.clone()).collect();
        self.exchanges = Some(Arc::new(names));
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wrap `entity` and publish it to `exchange`.
    ///
    /// # Errors
    ///
    /// `PublishError::Serialization` if the entity cannot be encoded, or the
    /// error of the publish itself.
    pub async fn send<T>(
        &self,
        exchange: &str,
        source: &str,
        kind: MessageKind,
        entity: &T,
    ) -> Result<(), PublishError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let envelope = wrap(exchange, source, kind, entity)?;
        self.send_envelope(exchange, envelope).await
    }

    /// As [`Self::send`], setting the numeric origin tag.
    ///
    /// # Errors
    ///
    /// As [`Self::send`].
    pub async fn send_with_origin<T>(
        &self,
        exchange: &str,
        origin: i32,
        source: &str,
        kind: MessageKind,
        entity: &T,
    ) -> Result<(), PublishError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let envelope = wrap(exchange, source, kind, entity)?.with_origin(origin);
        self.send_envelope(exchange, envelope).await
    }

    /// Publish `value` as plain JSON, without an envelope.
    ///
    /// # Errors
    ///
    /// As [`Self::send`].
    pub async fn publish_json<T>(&self, exchange: &str, value: &T) -> Result<(), PublishError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let body = serde_json::to_vec(value).map_err(|e| {
            serialization_failed(exchange, EnvelopeError::Serialization(e))
        })?;
        self.publish_bytes(exchange, body).await
    }

    async fn publish_bytes(&self, exchange: &str, body: Vec<u8>) -> Result<(), PublishError> {
        if let Some(known) = &self.exchanges {
            if !known.contains(exchange) {
                error!(exchange = %exchange, "Cannot publish to an undeclared exchange");
                return Err(PublishError::UnknownExchange(exchange.to_string()));
            }
        }

        let message_id = Uuid::new_v4().to_string();
        let bytes = body.len();
        let publication = Publication::new(exchange, body).with_message_id(message_id.clone());

        match self.supervisor.publish(publication, self.timeout).await {
            Ok(()) => {
                debug!(exchange = %exchange, message_id = %message_id, bytes, "Message published");
                Ok(())
            }
            Err(e) => {
                error!(exchange = %exchange, error = %e, "Cannot publish message");
                Err(e)
            }
        }
    }
}

#[async_trait]
impl MessagePublisher for Publisher {
    async fn send_envelope(&self, exchange: &str, envelope: Envelope) -> Result<(), PublishError> {
        let body = envelope
            .to_bytes()
            .map_err(|e| serialization_failed(exchange, e))?;
        debug!(
            exchange = %exchange,
            source = %envelope.source,
            kind = %envelope.kind,
            "Sending envelope"
        );
        self.publish_bytes(exchange, body).await
    }
}

fn wrap<T>(exchange: &str, source: &str, kind: MessageKind, entity: &T) -> Result<Envelope, PublishError>
where
    T: Serialize + ?Sized,
{
    Envelope::wrap(source, kind, entity).map_err(|e| serialization_failed(exchange, e))
}

fn serialization_failed(exchange: &str, cause: EnvelopeError) -> PublishError {
    error!(exchange = %exchange, error = %cause, "Cannot encode message");
    PublishError::Serialization {
        exchange: exchange.to_string(),
        cause,
    }
}

/// Records envelopes instead of publishing them.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    sent: Mutex<Vec<(String, Envelope)>>,
}

impl RecordingPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far, as `(exchange, envelope)`.
    #[must_use]
    pub fn sent(&self) -> Vec<(String, Envelope)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl MessagePublisher for RecordingPublisher {
    async fn send_envelope(&self, exchange: &str, envelope: Envelope) -> Result<(), PublishError> {
        self.sent.lock().push((exchange.to_string(), envelope));
        Ok(())
    }
}
