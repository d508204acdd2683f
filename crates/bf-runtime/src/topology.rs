//! Application topology.
//!
//! Exchanges are `<domain>.<purpose>`, queues `<exchange>:<consumer>`.

use bf_bus::{queue_name, MessagingConfig, Topology, TopologyError};

pub const EX_INVENTORY_UPDATES: &str = "bf.inventory.updates";
pub const QU_INVENTORY_UPDATES_TO_PORTFOLIO: &str = "bf.inventory.updates:portfolio";

pub const EX_EVENT: &str = "bf.system.events";
pub const QU_EVENT_TO_NOTIFIER: &str = "bf.system.events:notifier";

/// Exchanges whose queues are consumed with the dead-lettering retry
/// policy. None of them may serve as the dead-letter exchange.
pub const RETRYING_EXCHANGES: [&str; 2] = [EX_INVENTORY_UPDATES, EX_EVENT];

/// Consumer name of the queue bound to the dead-letter exchange.
pub const DEAD_LETTER_CONSUMER: &str = "store";

/// `Source` of envelopes carrying an [`bf_envelope::Event`].
pub const SOURCE_EVENT: &str = "event";

/// Exchanges, queues and bindings declared at startup. The dead-letter
/// route is included only when a dead-letter exchange is configured.
///
/// # Errors
///
/// `TopologyError` if the descriptor does not validate.
pub fn application_topology(config: &MessagingConfig) -> Result<Topology, TopologyError> {
    let mut builder = Topology::builder()
        .route(EX_INVENTORY_UPDATES, "portfolio")
        .route(EX_EVENT, "notifier");

    if let Some(exchange) = &config.dead_letter_exchange {
        builder = builder.route(exchange, DEAD_LETTER_CONSUMER);
    }
    builder.build()
}

/// Queue collecting dead letters, if dead-lettering is enabled.
#[must_use]
pub fn dead_letter_queue(config: &MessagingConfig) -> Option<String> {
    config
        .dead_letter_exchange
        .as_deref()
        .map(|exchange| queue_name(exchange, DEAD_LETTER_CONSUMER))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_topology() {
        let topology = application_topology(&MessagingConfig::default()).unwrap();

        let exchanges: Vec<_> = topology.exchanges().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(exchanges, vec![EX_INVENTORY_UPDATES, EX_EVENT, "bf.dead.letter"]);

        assert_eq!(
            topology.queues_of(EX_INVENTORY_UPDATES).collect::<Vec<_>>(),
            vec![QU_INVENTORY_UPDATES_TO_PORTFOLIO]
        );
        assert_eq!(
            topology.queues_of(EX_EVENT).collect::<Vec<_>>(),
            vec![QU_EVENT_TO_NOTIFIER]
        );
        assert_eq!(
            dead_letter_queue(&MessagingConfig::default()).as_deref(),
            Some("bf.dead.letter:store")
        );
    }

    #[test]
    fn test_without_dead_letter_exchange() {
        let config = MessagingConfig {
            dead_letter_exchange: None,
            ..MessagingConfig::default()
        };
        let topology = application_topology(&config).unwrap();
        assert_eq!(topology.exchanges().len(), 2);
        assert_eq!(topology.bindings().len(), 2);
        assert!(dead_letter_queue(&config).is_none());
    }

    #[test]
    fn test_custom_dead_letter_exchange() {
        let config = MessagingConfig {
            dead_letter_exchange: Some("bf.parking".to_string()),
            ..MessagingConfig::default()
        };
        let topology = application_topology(&config).unwrap();
        assert_eq!(
            topology.queues_of("bf.parking").collect::<Vec<_>>(),
            vec!["bf.parking:store"]
        );
    }
}
