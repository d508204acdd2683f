//! # Topology Manager
//!
//! Declares the exchanges, queues and bindings an application needs.
//!
//! Naming convention: exchanges are `<domain>.<purpose>`, queues are
//! `<exchange>:<consumer>`. Declarations are idempotent; a conflicting
//! redeclaration is a fatal configuration error.

use std::collections::HashMap;

use tracing::{debug, error, info};

use crate::error::TopologyError;
use crate::ports::{BindingSpec, ExchangeSpec, QueueSpec};
use crate::supervisor::ConnectionSupervisor;

/// Queue name for `consumer` reading from `exchange`.
#[must_use]
pub fn queue_name(exchange: &str, consumer: &str) -> String {
    format!("{exchange}:{consumer}")
}

/// A validated set of exchanges, queues and bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    exchanges: Vec<ExchangeSpec>,
    queues: Vec<QueueSpec>,
    bindings: Vec<BindingSpec>,
}

impl Topology {
    #[must_use]
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::default()
    }

    #[must_use]
    pub fn exchanges(&self) -> &[ExchangeSpec] {
        &self.exchanges
    }

    #[must_use]
    pub fn queues(&self) -> &[QueueSpec] {
        &self.queues
    }

    #[must_use]
    pub fn bindings(&self) -> &[BindingSpec] {
        &self.bindings
    }

    /// Queues bound to `exchange`.
    pub fn queues_of<'a>(&'a self, exchange: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.bindings
            .iter()
            .filter(move |b| b.exchange == exchange)
            .map(|b| b.queue.as_str())
    }
}

/// Collects declarations and validates them before any network call.
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    exchanges: Vec<ExchangeSpec>,
    queues: Vec<QueueSpec>,
    bindings: Vec<BindingSpec>,
}

impl TopologyBuilder {
    /// A durable fanout exchange.
    #[must_use]
    pub fn fanout(self, name: impl Into<String>) -> Self {
        self.exchange(ExchangeSpec::fanout(name))
    }

    #[must_use]
    pub fn exchange(mut self, spec: ExchangeSpec) -> Self {
        self.exchanges.push(spec);
        self
    }

    /// A durable queue.
    #[must_use]
    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.queues.push(QueueSpec::durable(name));
        self
    }

    #[must_use]
    pub fn queue_spec(mut self, spec: QueueSpec) -> Self {
        self.queues.push(spec);
        self
    }

    #[must_use]
    pub fn bind(mut self, exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        self.bindings.push(BindingSpec {
            exchange: exchange.into(),
            queue: queue.into(),
        });
        self
    }

    /// Fanout exchange plus the `<exchange>:<consumer>` queue bound to it.
    #[must_use]
    pub fn route(self, exchange: &str, consumer: &str) -> Self {
        let queue = queue_name(exchange, consumer);
        self.fanout(exchange).queue(queue.clone()).bind(exchange, queue)
    }

    /// Deduplicate and validate.
    ///
    /// # Errors
    ///
    /// `TopologyError::Conflict` when a name is declared twice with different
    /// parameters, `UnknownExchange`/`UnknownQueue` when a binding references
    /// an undeclared object.
    pub fn build(self) -> Result<Topology, TopologyError> {
        let exchanges = dedupe(self.exchanges, |e| e.name.clone())?;
        let queues = dedupe(self.queues, |q| q.name.clone())?;

        let mut bindings: Vec<BindingSpec> = Vec::new();
        for binding in self.bindings {
            if !exchanges.iter().any(|e| e.name == binding.exchange) {
                return Err(TopologyError::UnknownExchange(binding.exchange));
            }
            if !queues.iter().any(|q| q.name == binding.queue) {
                return Err(TopologyError::UnknownQueue(binding.queue));
            }
            if !bindings.contains(&binding) {
                bindings.push(binding);
            }
        }

        Ok(Topology {
            exchanges,
            queues,
            bindings,
        })
    }
}

fn dedupe<T, F>(items: Vec<T>, name_of: F) -> Result<Vec<T>, TopologyError>
where
    T: PartialEq,
    F: Fn(&T) -> String,
{
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<T> = Vec::new();
    for item in items {
        let name = name_of(&item);
        match seen.get(&name) {
            Some(&index) if unique[index] == item => {}
            Some(_) => return Err(TopologyError::Conflict(name)),
            None => {
                seen.insert(name, unique.len());
                unique.push(item);
            }
        }
    }
    Ok(unique)
}

/// Declare `topology` on the supervised link: exchanges, then queues, then
/// bindings. Any failure aborts and names the failing object.
///
/// # Errors
///
/// `TopologyError` with the first failing declaration.
pub async fn declare(
    supervisor: &ConnectionSupervisor,
    topology: &Topology,
) -> Result<(), TopologyError> {
    let link = supervisor.acquire().await?;
    let channel = link.channel();

    for exchange in &topology.exchanges {
        if let Err(cause) = channel.declare_exchange(exchange).await {
            error!(exchange = %exchange.name, error = %cause, "Cannot create exchange");
            return Err(TopologyError::Exchange {
                name: exchange.name.clone(),
                cause,
            });
        }
        debug!(exchange = %exchange.name, kind = exchange.kind.as_str(), "Exchange declared");
    }

    for queue in &topology.queues {
        if let Err(cause) = channel.declare_queue(queue).await {
            error!(queue = %queue.name, error = %cause, "Cannot create queue");
            return Err(TopologyError::Queue {
                name: queue.name.clone(),
                cause,
            });
        }
        debug!(queue = %queue.name, "Queue declared");
    }

    for binding in &topology.bindings {
        if let Err(cause) = channel.bind_queue(binding).await {
            error!(
                exchange = %binding.exchange,
                queue = %binding.queue,
                error = %cause,
                "Cannot bind queue to exchange"
            );
            return Err(TopologyError::Binding {
                exchange: binding.exchange.clone(),
                queue: binding.queue.clone(),
                cause,
            });
        }
    }

    info!(
        exchanges = topology.exchanges.len(),
        queues = topology.queues.len(),
        bindings = topology.bindings.len(),
        "Messaging topology declared"
    );
    Ok(())
}
