//! # Broker Port
//!
//! The protocol surface the core needs from a fanout / durable-queue /
//! manual-ack broker:
//!
//! - [`BrokerConnector`] opens a connection plus one logical channel.
//! - [`BrokerChannel`] declares topology, publishes, and subscribes.
//! - [`Delivery`] is one inbound message, settled through its
//!   [`Acknowledger`].
//!
//! A channel is NOT assumed safe for unserialized concurrent writes. Callers
//! go through [`crate::ConnectionSupervisor`], which serializes them.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::config::BrokerSettings;
use crate::error::BrokerError;

/// Stream of inbound deliveries for one subscription. Ends when the channel
/// closes.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// Routing behaviour of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Every bound queue receives a copy; routing keys are ignored.
    Fanout,
    /// Queues receive messages whose routing key equals the binding key.
    Direct,
}

impl ExchangeKind {
    /// Protocol name of the kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fanout => "fanout",
            Self::Direct => "direct",
        }
    }
}

/// Exchange declaration parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    /// A durable exchange of `kind`.
    pub fn durable(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
        }
    }

    /// A durable fanout exchange.
    pub fn fanout(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Fanout,
            durable: true,
        }
    }
}

/// Queue declaration parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
}

impl QueueSpec {
    /// A durable queue.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
        }
    }
}

/// Binds a queue to an exchange with an empty routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingSpec {
    pub exchange: String,
    pub queue: String,
}

/// An outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    /// Target exchange. The empty name is the broker's default exchange,
    /// which routes to the queue named by `routing_key`.
    pub exchange: String,
    /// Empty for fanout publishes.
    pub routing_key: String,
    pub body: Vec<u8>,
    pub content_type: String,
    pub message_id: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl Publication {
    /// A fanout publication of `body` to `exchange`.
    pub fn new(exchange: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: String::new(),
            body,
            content_type: bf_envelope::CONTENT_TYPE.to_string(),
            message_id: None,
            headers: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// Opens a connection and a logical channel over it.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Connect using `settings`.
    ///
    /// # Errors
    ///
    /// `BrokerError::Unreachable` or `BrokerError::AccessRefused`.
    async fn connect(&self, settings: &BrokerSettings) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

/// A logical channel to the broker.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Returns true while the channel and its connection are usable.
    fn is_open(&self) -> bool;

    /// Idempotently declare an exchange. Conflicting parameters fail with
    /// `BrokerError::PreconditionFailed`.
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError>;

    /// Idempotently declare a queue.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError>;

    /// Idempotently bind a queue to an exchange.
    async fn bind_queue(&self, binding: &BindingSpec) -> Result<(), BrokerError>;

    /// Publish one message and wait for the broker to accept it.
    async fn publish(&self, publication: Publication) -> Result<(), BrokerError>;

    /// Subscribe to `queue` in manual-acknowledgment mode. At most
    /// `BrokerSettings::prefetch_count` deliveries are outstanding at once.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError>;

    /// End the subscription named `consumer_tag`. Deliveries already handed
    /// to the stream are still yielded, then the stream ends. Unknown tags
    /// are ignored.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    /// Close the channel and its connection.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Settles a single delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// The message is done; the broker forgets it.
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Negative acknowledgment; `requeue` hands it back for redelivery.
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;

    /// Reject; with `requeue == false` the broker discards it.
    async fn reject(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// One inbound message.
pub struct Delivery {
    pub body: Vec<u8>,
    /// Broker message id, when the producer set one.
    pub message_id: Option<String>,
    /// True if the broker delivered this message before.
    pub redelivered: bool,
    pub headers: Vec<(String, String)>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            body,
            message_id: None,
            redelivered: false,
            headers: Vec::new(),
            acker,
        }
    }

    #[must_use]
    pub fn with_message_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id;
        self
    }

    #[must_use]
    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.body.len())
            .field("message_id", &self.message_id)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}
