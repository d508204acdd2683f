//! # Runtime Scenarios
//!
//! The assembled runtime: configuration → topology → consumer loops.

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use bf_bus::{InMemoryBroker, LinkState, MessagePublisher};
    use bf_envelope::{Envelope, EventLevel, MessageKind};
    use bf_runtime::topology::{EX_EVENT, QU_EVENT_TO_NOTIFIER};
    use bf_runtime::{MessagingRuntime, RuntimeConfig, RuntimeError};
    use serde_json::json;

    use crate::fixtures::{eventually, Portfolio};

    async fn start(broker: &InMemoryBroker) -> MessagingRuntime {
        MessagingRuntime::start(RuntimeConfig::default(), Arc::new(broker.clone()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_events_are_consumed_by_the_notifier() {
        let broker = InMemoryBroker::new();
        let runtime = start(&broker).await;
        let events = runtime.events();

        let mut params = BTreeMap::new();
        params.insert("portfolio".to_string(), json!("main"));
        events
            .send_event_by_code("alice", "PORTFOLIO_CREATED", params)
            .await
            .unwrap();
        events
            .send_event("bob", EventLevel::Warning, "Margin", "Margin below 10%", BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(broker.published(EX_EVENT).len(), 2);
        eventually(|| {
            broker.queue_depth(QU_EVENT_TO_NOTIFIER) == 0
                && broker.unacked_count(QU_EVENT_TO_NOTIFIER) == 0
        })
        .await;

        let stats = runtime.shutdown().await;
        let (_, notifier) = stats
            .iter()
            .find(|(queue, _)| queue == QU_EVENT_TO_NOTIFIER)
            .unwrap();
        assert_eq!(notifier.acked, 2);
        assert!(broker.discarded(QU_EVENT_TO_NOTIFIER).is_empty());
    }

    #[tokio::test]
    async fn test_dead_letters_are_stored() {
        let broker = InMemoryBroker::new();
        let runtime = start(&broker).await;

        let envelope =
            Envelope::wrap("inventory", MessageKind::Create, &Portfolio::new(1, "dead")).unwrap();
        runtime
            .publisher()
            .send_envelope("bf.dead.letter", envelope.clone())
            .await
            .unwrap();

        let store = runtime.dead_letters();
        eventually(|| store.len() == 1).await;
        assert_eq!(store.entries()[0].envelope, envelope);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_runtime_from_config_file() {
        let dir = std::env::temp_dir().join(format!("bf-tests-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("messaging.json");
        std::fs::write(
            &path,
            r#"{ "messaging": { "broker": { "username": "bf", "password": "secret" },
                                "dead_letter_exchange": null } }"#,
        )
        .unwrap();

        let config = RuntimeConfig::from_file(&path).unwrap();
        let broker = InMemoryBroker::with_credentials("bf", "secret");
        let runtime = MessagingRuntime::start(config, Arc::new(broker.clone()))
            .await
            .unwrap();
        assert_eq!(runtime.queues().count(), 2);

        let supervisor = Arc::clone(runtime.supervisor());
        runtime.shutdown().await;
        assert_eq!(supervisor.state(), LinkState::Disconnected);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_bad_credentials_abort_startup() {
        let broker = InMemoryBroker::with_credentials("bf", "secret");
        let result = MessagingRuntime::start(RuntimeConfig::default(), Arc::new(broker)).await;

        match result {
            Err(RuntimeError::Connectivity(e)) => assert!(e.is_access_refused()),
            other => panic!("expected a connectivity error, got {:?}", other.err()),
        }
    }
}
