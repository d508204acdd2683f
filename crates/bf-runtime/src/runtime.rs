//! Startup and shutdown of the messaging core.
//!
//! Each standard queue gets one loop for the life of the process. A loop
//! whose stream ended (the shared channel closed) subscribes again as soon
//! as the supervisor is back to `Connected`, or on its own after
//! [`RESTART_DELAY`].

use std::sync::Arc;
use std::time::Duration;

use bf_bus::topology::declare;
use bf_bus::{
    BrokerConnector, ConnectionSupervisor, ConsumeError, Consumer, ConsumerStats, EnvelopeHandler,
    LinkState, Publisher, RetryPolicy,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::events::EventSender;
use crate::handlers::{notifier_table, DeadLetterStore, InventoryUpdates};
use crate::topology::{
    application_topology, dead_letter_queue, QU_EVENT_TO_NOTIFIER,
    QU_INVENTORY_UPDATES_TO_PORTFOLIO,
};

type ConsumerTask = JoinHandle<Result<ConsumerStats, ConsumeError>>;

/// Longest a stopped loop waits before trying to subscribe by itself.
pub const RESTART_DELAY: Duration = Duration::from_secs(5);

/// The running messaging core of one process.
pub struct MessagingRuntime {
    config: RuntimeConfig,
    supervisor: Arc<ConnectionSupervisor>,
    publisher: Publisher,
    dead_letters: Arc<DeadLetterStore>,
    shutdown_tx: watch::Sender<bool>,
    consumers: Vec<(String, ConsumerTask)>,
}

impl MessagingRuntime {
    /// Start the messaging core.
    ///
    /// ## Startup Sequence
    ///
    /// 1. Validate configuration and build the topology and dispatch tables
    /// 2. Connect to the broker
    /// 3. Declare the topology
    /// 4. Spawn one consumer loop per standard queue
    ///
    /// # Errors
    ///
    /// Any failure before step 4 completes. The caller is expected to exit.
    pub async fn start(
        config: RuntimeConfig,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<Self, RuntimeError> {
        info!("===========================================");
        info!("  Bit-Fever Messaging v{}", env!("CARGO_PKG_VERSION"));
        info!("===========================================");

        config.validate()?;
        let messaging = &config.messaging;
        let topology = application_topology(messaging)?;
        let notifier = notifier_table()?;

        info!("Starting messaging...");
        let supervisor = ConnectionSupervisor::connect(connector, messaging.broker.clone()).await?;

        if let Err(e) = declare(&supervisor, &topology).await {
            supervisor.close().await;
            return Err(e.into());
        }

        let publisher = Publisher::new(Arc::clone(&supervisor))
            .with_timeout(messaging.publish_timeout())
            .with_topology(&topology);
        let (shutdown_tx, _) = watch::channel(false);

        let mut runtime = Self {
            supervisor,
            publisher,
            dead_letters: Arc::new(DeadLetterStore::default()),
            shutdown_tx,
            consumers: Vec::new(),
            config,
        };

        let policy = runtime.config.messaging.retry_policy();
        runtime.spawn_consumer(QU_INVENTORY_UPDATES_TO_PORTFOLIO, InventoryUpdates, policy.clone());
        runtime.spawn_consumer(QU_EVENT_TO_NOTIFIER, notifier, policy);

        if let Some(queue) = dead_letter_queue(&runtime.config.messaging) {
            // Never dead-letter the dead-letter queue into itself.
            let policy = RetryPolicy::bounded(runtime.config.messaging.max_redeliveries);
            let store = Arc::clone(&runtime.dead_letters);
            runtime.spawn_consumer(&queue, store, policy);
        }

        info!(
            address = %runtime.config.messaging.broker.address,
            consumers = runtime.consumers.len(),
            "Messaging started"
        );
        Ok(runtime)
    }

    fn spawn_consumer<H>(&mut self, queue: &str, handler: H, policy: RetryPolicy)
    where
        H: EnvelopeHandler + 'static,
    {
        let messaging = &self.config.messaging;
        let consumer = Consumer::new(Arc::clone(&self.supervisor), queue, handler)
            .with_retry_policy(policy)
            .with_consumer_tag(messaging.consumer_tag(queue))
            .with_publish_timeout(messaging.publish_timeout());

        let shutdown = self.shutdown_tx.subscribe();
        let task = tokio::spawn(keep_consuming(consumer, Arc::clone(&self.supervisor), shutdown));
        self.consumers.push((queue.to_string(), task));
    }

    /// Stop the consumer loops and close the link.
    ///
    /// ## Shutdown Sequence
    ///
    /// 1. Signal shutdown; in-flight deliveries are requeued
    /// 2. Await every consumer loop
    /// 3. Close the broker link
    ///
    /// Returns the stats of every loop that ended cleanly.
    pub async fn shutdown(self) -> Vec<(String, ConsumerStats)> {
        info!("Initiating graceful shutdown...");
        self.shutdown_tx.send_replace(true);

        let mut finished = Vec::with_capacity(self.consumers.len());
        for (queue, task) in self.consumers {
            match task.await {
                Ok(Ok(stats)) => {
                    info!(
                        queue = %queue,
                        received = stats.received,
                        acked = stats.acked,
                        requeued = stats.requeued,
                        dead_lettered = stats.dead_lettered,
                        restarts = stats.restarts,
                        "Consumer stopped"
                    );
                    finished.push((queue, stats));
                }
                Ok(Err(e)) => error!(queue = %queue, error = %e, "Consumer failed"),
                Err(e) => error!(queue = %queue, error = %e, "Consumer task panicked"),
            }
        }

        self.supervisor.close().await;
        info!("Shutdown complete");
        finished
    }

    /// Publisher sharing the runtime's link.
    #[must_use]
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    #[must_use]
    pub fn events(&self) -> EventSender {
        EventSender::new(Arc::new(self.publisher.clone()))
    }

    #[must_use]
    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    #[must_use]
    pub fn dead_letters(&self) -> Arc<DeadLetterStore> {
        Arc::clone(&self.dead_letters)
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Queues with a running consumer loop.
    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.consumers.iter().map(|(queue, _)| queue.as_str())
    }
}

/// Run `consumer` until shutdown, subscribing again whenever its stream
/// ends. The stats cover every subscription.
async fn keep_consuming<H>(
    consumer: Consumer<H>,
    supervisor: Arc<ConnectionSupervisor>,
    shutdown: watch::Receiver<bool>,
) -> Result<ConsumerStats, ConsumeError>
where
    H: EnvelopeHandler,
{
    let mut total = ConsumerStats::default();
    let mut signal = shutdown.clone();
    let mut states = supervisor.subscribe_state();

    loop {
        match consumer.consume(shutdown.clone()).await {
            Ok(stats) => {
                total.absorb(&stats);
                if stats.shutdown {
                    return Ok(total);
                }
                warn!(queue = %consumer.queue(), "Consumer stream ended, waiting for the link");
            }
            Err(e) => {
                warn!(queue = %consumer.queue(), error = %e, "Cannot subscribe, waiting for the link");
            }
        }

        tokio::select! {
            biased;
            () = stop_requested(&mut signal) => {
                total.shutdown = true;
                return Ok(total);
            }
            () = link_restored(&supervisor, &mut states) => {}
            () = tokio::time::sleep(RESTART_DELAY) => {}
        }
        total.restarts += 1;
        info!(queue = %consumer.queue(), restarts = total.restarts, "Restarting consumer");
    }
}

/// Resolves once the supervisor holds an open channel.
async fn link_restored(supervisor: &ConnectionSupervisor, states: &mut watch::Receiver<LinkState>) {
    loop {
        drop(states.borrow_and_update());
        let open = supervisor.channel().is_some_and(|channel| channel.is_open());
        if supervisor.state() == LinkState::Connected && open {
            return;
        }
        if states.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn stop_requested(signal: &mut watch::Receiver<bool>) {
    if signal.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
