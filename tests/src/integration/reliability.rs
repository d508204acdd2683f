//! # Reliability Scenarios
//!
//! Serialized publishing, link loss and reconnect, bounded retry into the
//! dead-letter store, and shutdown with messages in flight.

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use async_trait::async_trait;
    use bf_bus::{
        handler_fn, queue_name, EnvelopeHandler, MessagingConfig, PublishError, RetryPolicy,
        Topology, Verdict,
    };
    use bf_envelope::{Envelope, MessageKind};
    use bf_runtime::topology::{
        application_topology, dead_letter_queue, EX_INVENTORY_UPDATES,
        QU_INVENTORY_UPDATES_TO_PORTFOLIO,
    };
    use bf_runtime::DeadLetterStore;

    use crate::fixtures::{eventually, Bus, Portfolio, Seen};

    const EX: &str = "bf.inventory.updates";

    async fn single_queue() -> (Bus, String) {
        let topology = Topology::builder().route(EX, "portfolio").build().unwrap();
        (Bus::with_topology(&topology).await, queue_name(EX, "portfolio"))
    }

    fn collect(seen: &Seen<Portfolio>) -> impl EnvelopeHandler + 'static {
        let seen = seen.clone();
        handler_fn(move |e: &Envelope| {
            seen.push(e.entity_as().unwrap());
            true
        })
    }

    // =============================================================================
    // SERIALIZED PUBLISH
    // =============================================================================

    /// Concurrent senders share one channel; every payload arrives intact.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_publishes_arrive_intact() {
        let (bus, queue) = single_queue().await;
        let seen = Seen::new();
        let consumer = bus.spawn(&queue, collect(&seen), RetryPolicy::default());

        let sends: Vec<_> = (0..64u32)
            .map(|id| {
                let publisher = bus.publisher.clone();
                tokio::spawn(async move {
                    publisher
                        .send(EX, "inventory", MessageKind::Create, &Portfolio::new(id, "load"))
                        .await
                })
            })
            .collect();
        for send in sends {
            send.await.unwrap().unwrap();
        }

        eventually(|| seen.len() == 64).await;
        bus.drained(&queue).await;
        consumer.stop().await;

        let mut ids: Vec<u32> = seen.all().iter().map(|p| p.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..64).collect::<Vec<_>>());

        let message_ids: HashSet<_> = bus
            .broker
            .published(EX)
            .into_iter()
            .filter_map(|p| p.message_id)
            .collect();
        assert_eq!(message_ids.len(), 64);
        assert_eq!(bus.supervisor.reconnect_count(), 0);
    }

    // =============================================================================
    // LINK LOSS
    // =============================================================================

    #[tokio::test]
    async fn test_severed_link_is_reestablished_once_for_concurrent_senders() {
        let (bus, queue) = single_queue().await;
        let seen = Seen::new();
        let consumer = bus.spawn(&queue, collect(&seen), RetryPolicy::default());

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        bus.broker.sever_connections();
        let stats = consumer.finished().await;
        assert!(!stats.shutdown);

        let sends: Vec<_> = (0..8u32)
            .map(|id| {
                let publisher = bus.publisher.clone();
                tokio::spawn(async move {
                    publisher
                        .send(EX, "inventory", MessageKind::Create, &Portfolio::new(id, "after"))
                        .await
                })
            })
            .collect();
        for send in sends {
            send.await.unwrap().unwrap();
        }
        assert_eq!(bus.broker.connection_count(), 2);
        assert_eq!(bus.supervisor.reconnect_count(), 1);

        // A new loop picks up everything published after the reconnect.
        let consumer = bus.spawn(&queue, collect(&seen), RetryPolicy::default());
        eventually(|| seen.len() == 8).await;
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_publish_fails_while_broker_is_down_then_recovers() {
        let (bus, queue) = single_queue().await;
        bus.broker.set_reachable(false);
        bus.broker.sever_connections();

        let err = bus
            .publisher
            .send(EX, "inventory", MessageKind::Create, &Portfolio::new(1, "lost"))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Connectivity(_)));

        bus.broker.set_reachable(true);
        bus.publisher
            .send(EX, "inventory", MessageKind::Create, &Portfolio::new(2, "kept"))
            .await
            .unwrap();
        assert_eq!(bus.broker.queue_depth(&queue), 1);
    }

    // =============================================================================
    // RETRY AND DEAD LETTERS
    // =============================================================================

    /// A message the handler keeps rejecting ends up in the dead-letter store
    /// with its original bytes.
    #[tokio::test]
    async fn test_rejected_message_reaches_dead_letter_store() {
        let config = MessagingConfig {
            max_redeliveries: 2,
            ..MessagingConfig::default()
        };
        let bus = Bus::with_topology(&application_topology(&config).unwrap()).await;
        let dead_letters = dead_letter_queue(&config).unwrap();

        let store = Arc::new(DeadLetterStore::default());
        let store_loop = bus.spawn(&dead_letters, Arc::clone(&store), RetryPolicy::bounded(2));
        let portfolio_loop = bus.spawn(
            QU_INVENTORY_UPDATES_TO_PORTFOLIO,
            handler_fn(|_| false),
            config.retry_policy(),
        );

        bus.publisher
            .send(
                EX_INVENTORY_UPDATES,
                "inventory",
                MessageKind::Create,
                &Portfolio::new(9, "rejected"),
            )
            .await
            .unwrap();

        eventually(|| store.len() == 1).await;
        bus.drained(QU_INVENTORY_UPDATES_TO_PORTFOLIO).await;
        let stats = portfolio_loop.stop().await;
        store_loop.stop().await;

        assert_eq!(stats.requeued, 2);
        assert_eq!(stats.dead_lettered, 1);

        let original = bus.broker.published(EX_INVENTORY_UPDATES)[0].body.clone();
        let stored = &store.entries()[0].envelope;
        assert_eq!(stored.to_bytes().unwrap(), original);
        assert_eq!(
            stored.entity_as::<Portfolio>().unwrap(),
            Portfolio::new(9, "rejected")
        );
    }

    #[tokio::test]
    async fn test_unbounded_retry_until_accepted() {
        let (bus, queue) = single_queue().await;
        let attempts = Seen::new();
        let log = attempts.clone();
        let consumer = bus.spawn(
            &queue,
            handler_fn(move |e: &Envelope| {
                log.push(e.to_bytes().unwrap());
                log.len() > 5
            }),
            RetryPolicy::unbounded(),
        );

        bus.publisher
            .send(EX, "inventory", MessageKind::Update, &Portfolio::new(6, "stubborn"))
            .await
            .unwrap();
        eventually(|| attempts.len() == 6).await;
        bus.drained(&queue).await;
        let stats = consumer.stop().await;

        assert_eq!(stats.requeued, 5);
        assert_eq!(stats.acked, 1);
        let bodies = attempts.all();
        assert!(bodies.iter().all(|b| b == &bodies[0]));
    }

    // =============================================================================
    // SHUTDOWN
    // =============================================================================

    struct Stuck;

    #[async_trait]
    impl EnvelopeHandler for Stuck {
        async fn handle(&self, _envelope: &Envelope) -> Verdict {
            std::future::pending().await
        }
    }

    /// Deliveries in flight at shutdown, in the handler or prefetched
    /// behind it, go back to the queue and the next loop processes them.
    #[tokio::test]
    async fn test_in_flight_messages_survive_shutdown() {
        let (bus, queue) = single_queue().await;
        for id in 0..3u32 {
            bus.publisher
                .send(EX, "inventory", MessageKind::Create, &Portfolio::new(id, "in flight"))
                .await
                .unwrap();
        }

        let stuck = bus.spawn(&queue, Stuck, RetryPolicy::default());
        let broker = bus.broker.clone();
        eventually(|| broker.unacked_count(&queue) == 3).await;
        let stats = stuck.stop().await;
        assert_eq!(stats.requeued_on_shutdown, 3);
        assert_eq!(bus.broker.queue_depth(&queue), 3);
        assert_eq!(bus.broker.unacked_count(&queue), 0);

        let seen = Seen::new();
        let consumer = bus.spawn(&queue, collect(&seen), RetryPolicy::default());
        bus.drained(&queue).await;
        consumer.stop().await;

        let mut ids: Vec<u32> = seen.all().iter().map(|p| p.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(bus.supervisor.reconnect_count(), 0);
    }
}
