//! # Error Types
//!
//! Error taxonomy of the messaging core.
//!
//! | Error | Retried | Fatal at startup |
//! |-------|---------|------------------|
//! | `PublishError::Serialization` | never | n/a |
//! | `PublishError::UnknownExchange` | never | n/a |
//! | `ConnectivityError` | one reconnect | yes |
//! | `TopologyError` | never | always |
//! | poison message | never (discarded) | n/a |
//! | handler rejection | up to the retry bound | n/a |

use std::time::Duration;

use bf_envelope::{EnvelopeError, MessageKind};
use thiserror::Error;

/// Failures reported by a broker adapter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker could not be reached.
    #[error("broker unreachable at {address}: {reason}")]
    Unreachable { address: String, reason: String },

    /// The broker rejected the credentials.
    #[error("access refused for user '{username}'")]
    AccessRefused { username: String },

    /// The channel (or its connection) is no longer usable.
    #[error("channel is closed")]
    ChannelClosed,

    /// An object was redeclared with conflicting parameters.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// A referenced exchange or queue does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The broker negatively confirmed a publish.
    #[error("publish not confirmed by broker: {0}")]
    Nacked(String),

    /// Any other protocol-level failure.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// The broker link is down and could not be re-established.
#[derive(Debug, Error, Clone)]
#[error("messaging system at {address} is not available: {cause}")]
pub struct ConnectivityError {
    pub address: String,
    #[source]
    pub cause: BrokerError,
}

impl ConnectivityError {
    pub(crate) fn new(address: &str, cause: BrokerError) -> Self {
        Self {
            address: address.to_string(),
            cause,
        }
    }

    /// Returns true if the broker refused the configured credentials.
    #[must_use]
    pub fn is_access_refused(&self) -> bool {
        matches!(self.cause, BrokerError::AccessRefused { .. })
    }
}

/// Topology could not be established. Always fatal at startup.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("cannot create the '{name}' exchange: {cause}")]
    Exchange {
        name: String,
        #[source]
        cause: BrokerError,
    },

    #[error("cannot create the '{name}' queue: {cause}")]
    Queue {
        name: String,
        #[source]
        cause: BrokerError,
    },

    #[error("cannot bind queue '{queue}' to exchange '{exchange}': {cause}")]
    Binding {
        exchange: String,
        queue: String,
        #[source]
        cause: BrokerError,
    },

    #[error("binding references undeclared exchange '{0}'")]
    UnknownExchange(String),

    #[error("binding references undeclared queue '{0}'")]
    UnknownQueue(String),

    #[error("'{0}' is declared twice with different parameters")]
    Conflict(String),

    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),
}

/// A single `send` did not reach the broker.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The entity could not be encoded. Nothing was sent.
    #[error("cannot encode message for exchange '{exchange}': {cause}")]
    Serialization {
        exchange: String,
        #[source]
        cause: EnvelopeError,
    },

    /// The exchange is not part of the declared topology. Nothing was sent.
    #[error("exchange '{0}' is not declared")]
    UnknownExchange(String),

    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),

    #[error("publish to exchange '{exchange}' timed out after {after:?}")]
    Timeout { exchange: String, after: Duration },

    #[error("broker refused publish to exchange '{exchange}': {cause}")]
    Broker {
        exchange: String,
        #[source]
        cause: BrokerError,
    },
}

/// A consumer loop could not subscribe.
#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),

    #[error("cannot create the consumer for '{queue}': {cause}")]
    Subscribe {
        queue: String,
        #[source]
        cause: BrokerError,
    },
}

/// Handler registry is inconsistent. Detected before consuming.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("more than one handler registered for {origin}/{kind}")]
    Duplicate { origin: String, kind: MessageKind },

    #[error("no handler registered for {origin}/{kind}")]
    Missing { origin: String, kind: MessageKind },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_object() {
        let err = TopologyError::Binding {
            exchange: "bf.inventory.updates".into(),
            queue: "bf.inventory.updates:portfolio".into(),
            cause: BrokerError::NotFound("exchange".into()),
        };
        let text = err.to_string();
        assert!(text.contains("bf.inventory.updates:portfolio"));

        let err = PublishError::Timeout {
            exchange: "bf.system.events".into(),
            after: Duration::from_secs(30),
        };
        assert!(err.to_string().contains("bf.system.events"));
    }
}
