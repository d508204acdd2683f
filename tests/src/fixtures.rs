//! Shared setup for the integration scenarios.

use std::sync::Arc;
use std::time::Duration;

use bf_bus::topology::declare;
use bf_bus::{
    BrokerSettings, ConnectionSupervisor, ConsumeError, Consumer, ConsumerStats, EnvelopeHandler,
    InMemoryBroker, Publisher, RetryPolicy, Topology,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Upper bound for anything the scenarios wait on.
pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Portfolio {
    pub id: u32,
    pub name: String,
}

impl Portfolio {
    pub fn new(id: u32, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
        }
    }
}

/// Broker, supervised link and publisher with a topology already declared.
pub struct Bus {
    pub broker: InMemoryBroker,
    pub supervisor: Arc<ConnectionSupervisor>,
    pub publisher: Publisher,
}

impl Bus {
    pub async fn with_topology(topology: &Topology) -> Self {
        let broker = InMemoryBroker::new();
        let supervisor =
            ConnectionSupervisor::connect(Arc::new(broker.clone()), BrokerSettings::default())
                .await
                .unwrap();
        declare(&supervisor, topology).await.unwrap();
        let publisher = Publisher::new(Arc::clone(&supervisor))
            .with_timeout(WAIT)
            .with_topology(topology);
        Self {
            broker,
            supervisor,
            publisher,
        }
    }

    /// Start a consumer loop on `queue`.
    pub fn spawn<H>(&self, queue: &str, handler: H, policy: RetryPolicy) -> Running
    where
        H: EnvelopeHandler + 'static,
    {
        let (stop, signal) = watch::channel(false);
        let consumer = Consumer::new(Arc::clone(&self.supervisor), queue, handler)
            .with_retry_policy(policy)
            .with_publish_timeout(WAIT);
        Running {
            stop,
            task: tokio::spawn(consumer.run(signal)),
        }
    }

    /// Wait until `queue` holds no ready or unacknowledged message.
    pub async fn drained(&self, queue: &str) {
        let broker = self.broker.clone();
        eventually(|| broker.queue_depth(queue) == 0 && broker.unacked_count(queue) == 0).await;
    }
}

/// A spawned consumer loop.
pub struct Running {
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<ConsumerStats, ConsumeError>>,
}

impl Running {
    /// Signal shutdown and wait for the loop.
    pub async fn stop(self) -> ConsumerStats {
        self.stop.send_replace(true);
        self.finished().await
    }

    /// Wait for the loop to end on its own.
    pub async fn finished(self) -> ConsumerStats {
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("consumer loop did not end")
            .unwrap()
            .unwrap()
    }
}

pub async fn eventually(check: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Entities seen by a handler, shareable with the test body.
pub struct Seen<T>(Arc<Mutex<Vec<T>>>);

impl<T> Clone for Seen<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Clone> Seen<T> {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn push(&self, item: T) {
        self.0.lock().push(item);
    }

    pub fn all(&self) -> Vec<T> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }
}
