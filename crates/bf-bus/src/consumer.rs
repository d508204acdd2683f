//! # Consumer Loop
//!
//! One long-running worker per queue. For each delivery, in broker order:
//!
//! 1. decode the envelope; a message that does not decode is poison and is
//!    rejected without requeue
//! 2. hand the envelope to the [`EnvelopeHandler`]
//! 3. settle according to the verdict: `Accept` acks, `Discard` rejects,
//!    `Retry` requeues until the [`RetryPolicy`] bound and then dead-letters
//!
//! The loop ends when the delivery stream ends (the channel closed) or when
//! the shutdown signal fires. On shutdown the subscription is cancelled and
//! every delivery received but not yet settled, including those the client
//! prefetched, is requeued.

use std::sync::Arc;
use std::time::Duration;

use bf_envelope::decode;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::dispatch::{EnvelopeHandler, Verdict};
use crate::error::{BrokerError, ConsumeError};
use crate::ports::{BrokerChannel, Delivery, DeliveryStream, Publication};
use crate::retry::{RetryDecision, RetryLedger, RetryPolicy};
use crate::supervisor::ConnectionSupervisor;
use crate::DEFAULT_PUBLISH_TIMEOUT;

/// Header naming the queue a dead-lettered message came from.
pub const HEADER_ORIGIN_QUEUE: &str = "x-bf-origin-queue";
/// Header carrying the rejection count of a dead-lettered message.
pub const HEADER_REJECTIONS: &str = "x-bf-rejections";

/// How long a cancelled subscription may take to hand back its buffer.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Counters of one consumer run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    /// Deliveries that did not decode as an envelope.
    pub poisoned: u64,
    /// Discarded by the handler or dropped over the retry bound.
    pub discarded: u64,
    pub dead_lettered: u64,
    pub requeued_on_shutdown: u64,
    /// Subscriptions re-established after the stream ended.
    pub restarts: u64,
    /// True if the loop ended on the shutdown signal rather than a closed
    /// stream.
    pub shutdown: bool,
}

impl ConsumerStats {
    /// Add the counters of a later subscription of the same loop.
    pub fn absorb(&mut self, later: &Self) {
        self.received += later.received;
        self.acked += later.acked;
        self.requeued += later.requeued;
        self.poisoned += later.poisoned;
        self.discarded += later.discarded;
        self.dead_lettered += later.dead_lettered;
        self.requeued_on_shutdown += later.requeued_on_shutdown;
        self.restarts += later.restarts;
        self.shutdown = later.shutdown;
    }
}

/// Worker bound to one queue.
pub struct Consumer<H> {
    supervisor: Arc<ConnectionSupervisor>,
    queue: String,
    handler: H,
    policy: RetryPolicy,
    consumer_tag: String,
    publish_timeout: Duration,
}

impl<H: EnvelopeHandler> Consumer<H> {
    pub fn new(supervisor: Arc<ConnectionSupervisor>, queue: impl Into<String>, handler: H) -> Self {
        let queue = queue.into();
        Self {
            supervisor,
            consumer_tag: format!("bf-{queue}"),
            queue,
            handler,
            policy: RetryPolicy::default(),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = consumer_tag.into();
        self
    }

    /// Deadline for dead-letter publishes.
    #[must_use]
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Consume until the stream ends or `shutdown` becomes true.
    ///
    /// # Errors
    ///
    /// `ConsumeError` if the subscription cannot be established.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<ConsumerStats, ConsumeError> {
        self.consume(shutdown).await
    }

    /// One subscription. May be called again once a previous one ended on a
    /// closed stream.
    ///
    /// # Errors
    ///
    /// As [`Self::run`].
    pub async fn consume(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ConsumerStats, ConsumeError> {
        let channel = self.supervisor.ensure_live().await?;
        let mut deliveries = match channel.consume(&self.queue, &self.consumer_tag).await {
            Ok(stream) => stream,
            Err(cause) => {
                error!(queue = %self.queue, error = %cause, "Cannot create the consumer");
                return Err(ConsumeError::Subscribe {
                    queue: self.queue.clone(),
                    cause,
                });
            }
        };
        info!(queue = %self.queue, consumer = %self.consumer_tag, "Consumer started");

        let mut ledger = RetryLedger::new(self.policy.clone());
        let mut stats = ConsumerStats::default();

        loop {
            let next = tokio::select! {
                biased;
                () = shutdown_requested(&mut shutdown) => {
                    stats.shutdown = true;
                    break;
                }
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    warn!(queue = %self.queue, error = %e, "Delivery stream failed");
                    break;
                }
                None => {
                    info!(queue = %self.queue, "Delivery stream closed");
                    break;
                }
            };
            stats.received += 1;

            let envelope = match decode(&delivery.body) {
                Ok(envelope) => envelope,
                Err(e) => {
                    error!(
                        queue = %self.queue,
                        bytes = delivery.body.len(),
                        error = %e,
                        "Cannot decode message, discarding"
                    );
                    self.report(delivery.reject(false).await, "reject");
                    stats.poisoned += 1;
                    continue;
                }
            };

            let verdict = tokio::select! {
                biased;
                () = shutdown_requested(&mut shutdown) => None,
                verdict = self.handler.handle(&envelope) => Some(verdict),
            };

            let Some(verdict) = verdict else {
                if self.report(delivery.nack(true).await, "nack") {
                    stats.requeued_on_shutdown += 1;
                }
                stats.shutdown = true;
                break;
            };

            debug!(
                queue = %self.queue,
                source = %envelope.source,
                kind = %envelope.kind,
                verdict = ?verdict,
                "Message handled"
            );
            self.settle(&delivery, verdict, &mut ledger, &mut stats).await;
        }

        if stats.shutdown {
            self.release(&channel, &mut deliveries, &mut stats).await;
        }

        info!(
            queue = %self.queue,
            received = stats.received,
            acked = stats.acked,
            requeued = stats.requeued,
            poisoned = stats.poisoned,
            dead_lettered = stats.dead_lettered,
            requeued_on_shutdown = stats.requeued_on_shutdown,
            shutdown = stats.shutdown,
            "Consumer stopped"
        );
        Ok(stats)
    }

    /// Cancel the subscription and requeue whatever the client still holds.
    async fn release(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        deliveries: &mut DeliveryStream,
        stats: &mut ConsumerStats,
    ) {
        if let Err(e) = channel.cancel(&self.consumer_tag).await {
            warn!(queue = %self.queue, error = %e, "Cannot cancel the consumer");
            return;
        }

        let drain = async {
            while let Some(Ok(delivery)) = deliveries.next().await {
                if self.report(delivery.nack(true).await, "nack") {
                    stats.requeued_on_shutdown += 1;
                }
            }
        };
        if tokio::time::timeout(RELEASE_TIMEOUT, drain).await.is_err() {
            warn!(
                queue = %self.queue,
                "Consumer cancel not confirmed, buffered deliveries stay with the channel"
            );
        }
    }

    async fn settle(
        &self,
        delivery: &Delivery,
        verdict: Verdict,
        ledger: &mut RetryLedger,
        stats: &mut ConsumerStats,
    ) {
        match verdict {
            Verdict::Accept => {
                if self.report(delivery.ack().await, "ack") {
                    stats.acked += 1;
                }
                ledger.settle(&RetryLedger::key_for(delivery));
            }
            Verdict::Discard => {
                if self.report(delivery.reject(false).await, "reject") {
                    stats.discarded += 1;
                }
                ledger.settle(&RetryLedger::key_for(delivery));
            }
            Verdict::Retry => {
                let key = RetryLedger::key_for(delivery);
                match ledger.record_rejection(&key) {
                    RetryDecision::Requeue { attempt } => {
                        warn!(queue = %self.queue, attempt, "Handler rejected message, requeueing");
                        if self.report(delivery.nack(true).await, "nack") {
                            stats.requeued += 1;
                        }
                    }
                    RetryDecision::DeadLetter { attempts, exchange } => {
                        let publication = Publication::new(exchange.clone(), delivery.body.clone())
                            .with_message_id(key)
                            .with_header(HEADER_ORIGIN_QUEUE, self.queue.clone())
                            .with_header(HEADER_REJECTIONS, attempts.to_string());

                        match self.supervisor.publish(publication, self.publish_timeout).await {
                            Ok(()) => {
                                warn!(
                                    queue = %self.queue,
                                    exchange = %exchange,
                                    attempts,
                                    "Message exceeded its redeliveries, dead-lettered"
                                );
                                if self.report(delivery.ack().await, "ack") {
                                    stats.dead_lettered += 1;
                                }
                            }
                            Err(e) => {
                                error!(
                                    queue = %self.queue,
                                    exchange = %exchange,
                                    error = %e,
                                    "Cannot dead-letter message, requeueing"
                                );
                                if self.report(delivery.nack(true).await, "nack") {
                                    stats.requeued += 1;
                                }
                            }
                        }
                    }
                    RetryDecision::Drop { attempts } => {
                        warn!(
                            queue = %self.queue,
                            attempts,
                            "Message exceeded its redeliveries, discarding"
                        );
                        if self.report(delivery.reject(false).await, "reject") {
                            stats.discarded += 1;
                        }
                    }
                }
            }
        }
    }

    /// Log a failed settlement. Returns true on success.
    fn report(&self, result: Result<(), BrokerError>, action: &str) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                error!(queue = %self.queue, action, error = %e, "Cannot settle message");
                false
            }
        }
    }
}

/// Resolves once the signal is true. A dropped sender never resolves.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
