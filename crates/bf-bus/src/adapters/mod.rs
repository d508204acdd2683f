//! Broker adapters implementing [`crate::ports`].

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod in_memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use in_memory::InMemoryBroker;
