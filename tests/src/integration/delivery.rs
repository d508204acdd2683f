//! # Delivery Scenarios
//!
//! Publisher → fanout exchange → bound queues → consumer loops, with typed
//! dispatch on the receiving side.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bf_bus::{handler_fn, queue_name, DispatchTable, RetryPolicy, Topology, Verdict};
    use bf_envelope::{Envelope, MessageKind};

    use crate::fixtures::{eventually, Bus, Portfolio, Seen};

    const EX: &str = "bf.inventory.updates";

    fn portfolio_table(seen: &Seen<Portfolio>) -> DispatchTable {
        let seen = seen.clone();
        DispatchTable::builder()
            .on("inventory", MessageKind::Create, move |p: Portfolio| {
                seen.push(p);
                async { Verdict::Accept }
            })
            .build()
            .unwrap()
    }

    // =============================================================================
    // FANOUT
    // =============================================================================

    /// E bound to Q1 and Q2: each queue's consumer sees the entity once. A
    /// rejection on Q1 redelivers the same bytes there and nothing on Q2.
    #[tokio::test]
    async fn test_entity_reaches_every_bound_queue_once() {
        let topology = Topology::builder()
            .route(EX, "portfolio")
            .route(EX, "audit")
            .build()
            .unwrap();
        let bus = Bus::with_topology(&topology).await;
        let q1 = queue_name(EX, "portfolio");
        let q2 = queue_name(EX, "audit");

        let bodies_q1 = Seen::new();
        let log = bodies_q1.clone();
        let seen_q2 = Seen::new();
        let c1 = bus.spawn(
            &q1,
            handler_fn(move |e: &Envelope| {
                log.push(e.to_bytes().unwrap());
                log.len() > 1
            }),
            RetryPolicy::default(),
        );
        let c2 = bus.spawn(&q2, portfolio_table(&seen_q2), RetryPolicy::default());

        let portfolio = Portfolio::new(1, "main");
        bus.publisher
            .send(EX, "inventory", MessageKind::Create, &portfolio)
            .await
            .unwrap();

        eventually(|| bodies_q1.len() == 2).await;
        bus.drained(&q1).await;
        bus.drained(&q2).await;
        let s1 = c1.stop().await;
        let s2 = c2.stop().await;

        let bodies = bodies_q1.all();
        assert_eq!(bodies[0], bodies[1]);
        assert_eq!(bodies[0], bus.broker.published(EX)[0].body);
        assert_eq!((s1.received, s1.requeued, s1.acked), (2, 1, 1));

        assert_eq!(seen_q2.all(), vec![portfolio]);
        assert_eq!((s2.received, s2.acked), (1, 1));
    }

    /// An acknowledged message is not delivered again to a new subscription.
    #[tokio::test]
    async fn test_acknowledged_message_is_gone_after_resubscribe() {
        let topology = Topology::builder().route(EX, "portfolio").build().unwrap();
        let bus = Bus::with_topology(&topology).await;
        let queue = queue_name(EX, "portfolio");

        let first = Seen::new();
        let consumer = bus.spawn(&queue, portfolio_table(&first), RetryPolicy::default());
        bus.publisher
            .send(EX, "inventory", MessageKind::Create, &Portfolio::new(2, "ack"))
            .await
            .unwrap();
        bus.drained(&queue).await;
        consumer.stop().await;
        assert_eq!(first.len(), 1);

        let second = Seen::new();
        let consumer = bus.spawn(&queue, portfolio_table(&second), RetryPolicy::default());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = consumer.stop().await;

        assert_eq!(second.len(), 0);
        assert_eq!(stats.received, 0);
    }

    #[tokio::test]
    async fn test_publish_to_exchange_without_queues() {
        let topology = Topology::builder().fanout("bf.orphan").build().unwrap();
        let bus = Bus::with_topology(&topology).await;

        bus.publisher
            .send("bf.orphan", "inventory", MessageKind::Create, &Portfolio::new(3, "none"))
            .await
            .unwrap();
        assert_eq!(bus.broker.published("bf.orphan").len(), 1);
    }

    // =============================================================================
    // MALFORMED AND UNROUTED INPUT
    // =============================================================================

    #[tokio::test]
    async fn test_poison_message_does_not_block_valid_traffic() {
        let topology = Topology::builder().route(EX, "portfolio").build().unwrap();
        let bus = Bus::with_topology(&topology).await;
        let queue = queue_name(EX, "portfolio");

        bus.broker.enqueue(&queue, b"\x00\x01 garbage".to_vec()).unwrap();
        bus.publisher
            .send(EX, "inventory", MessageKind::Create, &Portfolio::new(4, "after"))
            .await
            .unwrap();

        let seen = Seen::new();
        let consumer = bus.spawn(&queue, portfolio_table(&seen), RetryPolicy::unbounded());
        bus.drained(&queue).await;
        let stats = consumer.stop().await;

        assert_eq!(seen.all(), vec![Portfolio::new(4, "after")]);
        assert_eq!(stats.poisoned, 1);
        assert_eq!(stats.requeued, 0);
        assert_eq!(bus.broker.discarded(&queue), vec![b"\x00\x01 garbage".to_vec()]);
    }

    #[tokio::test]
    async fn test_unrouted_tag_and_wrong_entity_are_discarded() {
        let topology = Topology::builder().route(EX, "portfolio").build().unwrap();
        let bus = Bus::with_topology(&topology).await;
        let queue = queue_name(EX, "portfolio");

        bus.publisher
            .send(EX, "inventory", MessageKind::Delete, &Portfolio::new(5, "unrouted"))
            .await
            .unwrap();
        bus.publisher
            .send(EX, "inventory", MessageKind::Create, "not a portfolio")
            .await
            .unwrap();

        let seen = Seen::new();
        let consumer = bus.spawn(&queue, portfolio_table(&seen), RetryPolicy::unbounded());
        bus.drained(&queue).await;
        let stats = consumer.stop().await;

        assert_eq!(seen.len(), 0);
        assert_eq!(stats.discarded, 2);
        assert_eq!(bus.broker.discarded(&queue).len(), 2);
    }

    /// Producers already deployed write the same wire format, with either
    /// field-name casing.
    #[tokio::test]
    async fn test_envelopes_from_existing_producers() {
        let topology = Topology::builder().route(EX, "portfolio").build().unwrap();
        let bus = Bus::with_topology(&topology).await;
        let queue = queue_name(EX, "portfolio");

        let entity = "eyJpZCI6NywibmFtZSI6ImxlZ2FjeSJ9";
        let upper = format!(
            r#"{{"Origin":3,"Type":1,"Source":"inventory","Entity":"{entity}"}}"#
        );
        let lower = format!(r#"{{"type":1,"source":"inventory","entity":"{entity}"}}"#);
        bus.broker.enqueue(&queue, upper.into_bytes()).unwrap();
        bus.broker.enqueue(&queue, lower.into_bytes()).unwrap();

        let seen = Seen::new();
        let sink = seen.clone();
        let table = DispatchTable::builder()
            .on("inventory", MessageKind::Update, move |p: Portfolio| {
                sink.push(p);
                async { Verdict::Accept }
            })
            .build()
            .unwrap();
        let consumer = bus.spawn(&queue, table, RetryPolicy::default());
        bus.drained(&queue).await;
        let stats = consumer.stop().await;

        assert_eq!(seen.all(), vec![Portfolio::new(7, "legacy"); 2]);
        assert_eq!(stats.acked, 2);
    }
}
