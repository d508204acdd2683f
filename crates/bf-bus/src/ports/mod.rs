//! Ports (driven side) through which the core reaches a broker.
//!
//! Adapters in [`crate::adapters`] implement these traits.

pub mod broker;

pub use broker::{
    Acknowledger, BindingSpec, BrokerChannel, BrokerConnector, Delivery, DeliveryStream,
    ExchangeKind, ExchangeSpec, Publication, QueueSpec,
};
