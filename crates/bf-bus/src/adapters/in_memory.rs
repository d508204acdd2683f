//! # In-Memory Broker
//!
//! A single-process broker behind the [`BrokerConnector`] port.
//!
//! It keeps the broker semantics the core relies on: fanout exchanges,
//! durable queues with ready/unacknowledged messages, manual acknowledgment,
//! requeue on nack and on channel close, per-subscription prefetch, and
//! AMQP-style channel closure on conflicting declarations. A channel-level
//! error closes the channel but leaves its connection open until `close`. Suitable for tests and single-node deployments;
//! multi-process deployments use the AMQP adapter.
//!
//! Test hooks (`sever_connections`, `set_reachable`, `set_publish_delay`,
//! `set_nack_publishes`) simulate broker failures.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::BrokerSettings;
use crate::error::BrokerError;
use crate::ports::{
    Acknowledger, BindingSpec, BrokerChannel, BrokerConnector, Delivery, DeliveryStream,
    ExchangeKind, ExchangeSpec, Publication, QueueSpec,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    message_id: Option<String>,
    headers: Vec<(String, String)>,
    redelivered: bool,
}

impl StoredMessage {
    fn from_publication(publication: &Publication) -> Self {
        Self {
            body: publication.body.clone(),
            message_id: publication.message_id.clone(),
            headers: publication.headers.clone(),
            redelivered: false,
        }
    }
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    /// delivery tag -> (channel id, message)
    unacked: HashMap<u64, (u64, StoredMessage)>,
    discarded: Vec<StoredMessage>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            discarded: Vec::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn requeue_front(&mut self, mut message: StoredMessage) {
        message.redelivered = true;
        self.ready.push_front(message);
    }
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    /// exchange -> bound queues, in binding order
    bindings: HashMap<String, Vec<String>>,
    published: HashMap<String, Vec<Publication>>,
    channels: HashMap<u64, Arc<AtomicBool>>,
    /// Connections not yet closed, by the id of their channel.
    connections: HashSet<u64>,
    next_tag: u64,
}

struct Core {
    state: Mutex<State>,
    reachable: AtomicBool,
    nack_publishes: AtomicBool,
    publish_delay: Mutex<Option<Duration>>,
    credentials: Option<(String, String)>,
    connect_attempts: AtomicU64,
    connections: AtomicU64,
    next_channel: AtomicU64,
}

impl Core {
    fn new(credentials: Option<(String, String)>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            reachable: AtomicBool::new(true),
            nack_publishes: AtomicBool::new(false),
            publish_delay: Mutex::new(None),
            credentials,
            connect_attempts: AtomicU64::new(0),
            connections: AtomicU64::new(0),
            next_channel: AtomicU64::new(1),
        }
    }

    /// Close a channel: mark it, requeue its unacknowledged messages, and
    /// wake every consumer so closed streams end.
    fn close_connection(&self, channel_id: u64) {
        self.close_channel(channel_id);
        self.state.lock().connections.remove(&channel_id);
    }

    fn close_channel(&self, channel_id: u64) {
        let mut state = self.state.lock();
        if let Some(open) = state.channels.remove(&channel_id) {
            open.store(false, Ordering::SeqCst);
        }

        for queue in state.queues.values_mut() {
            let mut tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, (owner, _))| *owner == channel_id)
                .map(|(tag, _)| *tag)
                .collect();
            tags.sort_unstable();

            for tag in tags.into_iter().rev() {
                if let Some((_, message)) = queue.unacked.remove(&tag) {
                    queue.requeue_front(message);
                }
            }
            queue.notify.notify_waiters();
        }
    }

    fn route(&self, publication: &Publication) -> Result<(), BrokerError> {
        let mut state = self.state.lock();

        let targets: Vec<String> = if publication.exchange.is_empty() {
            if !state.queues.contains_key(&publication.routing_key) {
                return Err(BrokerError::NotFound(format!(
                    "no queue '{}'",
                    publication.routing_key
                )));
            }
            vec![publication.routing_key.clone()]
        } else {
            let Some(exchange) = state.exchanges.get(&publication.exchange) else {
                return Err(BrokerError::NotFound(format!(
                    "no exchange '{}'",
                    publication.exchange
                )));
            };
            let bound = state
                .bindings
                .get(&publication.exchange)
                .cloned()
                .unwrap_or_default();
            match exchange.kind {
                ExchangeKind::Fanout => bound,
                // Bindings carry the empty key.
                ExchangeKind::Direct if publication.routing_key.is_empty() => bound,
                ExchangeKind::Direct => Vec::new(),
            }
        };

        state
            .published
            .entry(publication.exchange.clone())
            .or_default()
            .push(publication.clone());

        let message = StoredMessage::from_publication(publication);
        for name in &targets {
            if let Some(queue) = state.queues.get_mut(name) {
                queue.ready.push_back(message.clone());
                queue.notify.notify_waiters();
            }
        }

        debug!(
            exchange = %publication.exchange,
            queues = targets.len(),
            bytes = publication.body.len(),
            "In-memory publish routed"
        );
        Ok(())
    }

    /// Next ready message, unless `channel_id` already holds `prefetch`
    /// unacknowledged ones from this queue. Zero means no limit.
    fn take(self: &Arc<Self>, channel_id: u64, queue_name: &str, prefetch: usize) -> Option<Delivery> {
        let mut state = self.state.lock();
        let tag = state.next_tag + 1;
        let queue = state.queues.get_mut(queue_name)?;
        let outstanding = queue
            .unacked
            .values()
            .filter(|(owner, _)| *owner == channel_id)
            .count();
        if prefetch > 0 && outstanding >= prefetch {
            return None;
        }
        let message = queue.ready.pop_front()?;
        queue.unacked.insert(tag, (channel_id, message.clone()));
        state.next_tag = tag;

        let acker = InMemoryAcker {
            core: Arc::clone(self),
            queue: queue_name.to_string(),
            tag,
        };
        Some(
            Delivery::new(message.body, Box::new(acker))
                .with_message_id(message.message_id)
                .with_redelivered(message.redelivered)
                .with_headers(message.headers),
        )
    }

    fn settle(&self, queue_name: &str, tag: u64, outcome: Settlement) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| BrokerError::NotFound(format!("no queue '{queue_name}'")))?;

        let Some((channel_id, message)) = queue.unacked.remove(&tag) else {
            // Already settled, or requeued when its channel closed.
            return Err(BrokerError::ChannelClosed);
        };

        match outcome {
            Settlement::Ack => {}
            Settlement::Requeue => queue.requeue_front(message),
            Settlement::Discard => queue.discarded.push(message),
        }
        queue.notify.notify_waiters();

        let channel_open = state
            .channels
            .get(&channel_id)
            .is_some_and(|open| open.load(Ordering::SeqCst));
        if channel_open {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }
}

enum Settlement {
    Ack,
    Requeue,
    Discard,
}

/// In-process broker. Cloning shares the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    core: Arc<Core>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// A broker accepting any credentials.
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Arc::new(Core::new(None)),
        }
    }

    /// A broker accepting only `username`/`password`.
    #[must_use]
    pub fn with_credentials(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            core: Arc::new(Core::new(Some((username.into(), password.into())))),
        }
    }

    /// Make new connections fail (or succeed again).
    pub fn set_reachable(&self, reachable: bool) {
        self.core.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Close every connection, as a dropped TCP connection would.
    pub fn sever_connections(&self) {
        let ids: Vec<u64> = self.core.state.lock().connections.iter().copied().collect();
        for id in &ids {
            self.core.close_connection(*id);
        }
        warn!(channels = ?ids, "In-memory broker severed all connections");
    }

    /// Hold every publish for `delay` before confirming it.
    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        *self.core.publish_delay.lock() = delay;
    }

    /// Negatively confirm every publish.
    pub fn set_nack_publishes(&self, nack: bool) {
        self.core.nack_publishes.store(nack, Ordering::SeqCst);
    }

    /// Put raw bytes straight onto a queue.
    pub fn enqueue(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        self.core
            .route(&Publication::new("", body).with_routing_key(queue))
    }

    /// Every publication accepted by `exchange`, in order.
    #[must_use]
    pub fn published(&self, exchange: &str) -> Vec<Publication> {
        self.core
            .state
            .lock()
            .published
            .get(exchange)
            .cloned()
            .unwrap_or_default()
    }

    /// Bodies rejected from `queue` without requeue.
    #[must_use]
    pub fn discarded(&self, queue: &str) -> Vec<Vec<u8>> {
        self.core
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.discarded.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Messages waiting for delivery on `queue`.
    #[must_use]
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.core
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered from `queue` but not yet settled.
    #[must_use]
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.core
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    #[must_use]
    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.core.state.lock().exchanges.get(name).cloned()
    }

    #[must_use]
    pub fn queue(&self, name: &str) -> Option<QueueSpec> {
        self.core
            .state
            .lock()
            .queues
            .get(name)
            .map(|q| q.spec.clone())
    }

    /// Queues bound to `exchange`.
    #[must_use]
    pub fn bindings(&self, exchange: &str) -> Vec<String> {
        self.core
            .state
            .lock()
            .bindings
            .get(exchange)
            .cloned()
            .unwrap_or_default()
    }

    /// Connection attempts, successful or not.
    #[must_use]
    pub fn connect_attempts(&self) -> u64 {
        self.core.connect_attempts.load(Ordering::SeqCst)
    }

    /// Successful connections.
    #[must_use]
    pub fn connection_count(&self) -> u64 {
        self.core.connections.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn open_channels(&self) -> usize {
        self.core.state.lock().channels.len()
    }

    /// Connections opened and not yet closed, whether or not their channel
    /// is still usable.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.core.state.lock().connections.len()
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self, settings: &BrokerSettings) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        self.core.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if !self.core.reachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unreachable {
                address: settings.address.clone(),
                reason: "connection refused".to_string(),
            });
        }
        if let Some((username, password)) = &self.core.credentials {
            if *username != settings.username || *password != settings.password {
                return Err(BrokerError::AccessRefused {
                    username: settings.username.clone(),
                });
            }
        }

        let id = self.core.next_channel.fetch_add(1, Ordering::SeqCst);
        let open = Arc::new(AtomicBool::new(true));
        {
            let mut state = self.core.state.lock();
            state.channels.insert(id, Arc::clone(&open));
            state.connections.insert(id);
        }
        self.core.connections.fetch_add(1, Ordering::SeqCst);

        debug!(channel = id, name = %settings.connection_name, "In-memory connection opened");
        Ok(Arc::new(InMemoryChannel {
            id,
            core: Arc::clone(&self.core),
            open,
            writing: AtomicBool::new(false),
            prefetch: usize::from(settings.prefetch_count),
            consumers: Mutex::new(HashMap::new()),
        }))
    }
}

struct InMemoryChannel {
    id: u64,
    core: Arc<Core>,
    open: Arc<AtomicBool>,
    writing: AtomicBool,
    prefetch: usize,
    /// consumer tag -> (still active, queue notifier)
    consumers: Mutex<HashMap<String, (Arc<AtomicBool>, Arc<Notify>)>>,
}

impl InMemoryChannel {
    fn check_open(&self) -> Result<(), BrokerError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }

    /// Channel-level errors close the channel.
    fn fail(&self, error: BrokerError) -> BrokerError {
        self.core.close_channel(self.id);
        error
    }
}

/// Clears the in-flight write flag, even if the publish is cancelled.
struct WriteGuard<'a>(&'a AtomicBool);

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        self.check_open()?;
        let conflict = {
            let mut state = self.core.state.lock();
            match state.exchanges.get(&spec.name) {
                Some(existing) => existing != spec,
                None => {
                    state.exchanges.insert(spec.name.clone(), spec.clone());
                    false
                }
            }
        };
        if conflict {
            return Err(self.fail(BrokerError::PreconditionFailed(format!(
                "inequivalent arguments for exchange '{}'",
                spec.name
            ))));
        }
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        self.check_open()?;
        let conflict = {
            let mut state = self.core.state.lock();
            match state.queues.get(&spec.name) {
                Some(existing) => existing.spec != *spec,
                None => {
                    state
                        .queues
                        .insert(spec.name.clone(), QueueState::new(spec.clone()));
                    false
                }
            }
        };
        if conflict {
            return Err(self.fail(BrokerError::PreconditionFailed(format!(
                "inequivalent arguments for queue '{}'",
                spec.name
            ))));
        }
        Ok(())
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<(), BrokerError> {
        self.check_open()?;
        let missing = {
            let mut state = self.core.state.lock();
            if !state.exchanges.contains_key(&binding.exchange) {
                Some(format!("no exchange '{}'", binding.exchange))
            } else if !state.queues.contains_key(&binding.queue) {
                Some(format!("no queue '{}'", binding.queue))
            } else {
                let bound = state.bindings.entry(binding.exchange.clone()).or_default();
                if !bound.contains(&binding.queue) {
                    bound.push(binding.queue.clone());
                }
                None
            }
        };
        match missing {
            Some(what) => Err(self.fail(BrokerError::NotFound(what))),
            None => Ok(()),
        }
    }

    async fn publish(&self, publication: Publication) -> Result<(), BrokerError> {
        self.check_open()?;
        if self.writing.swap(true, Ordering::SeqCst) {
            return Err(self.fail(BrokerError::Protocol(
                "interleaved frames on channel".to_string(),
            )));
        }
        let _writing = WriteGuard(&self.writing);

        // Frames of one publish are not atomic.
        tokio::task::yield_now().await;
        let delay = *self.core.publish_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_open()?;

        if self.core.nack_publishes.load(Ordering::SeqCst) {
            return Err(BrokerError::Nacked(publication.exchange));
        }
        self.core.route(&publication).map_err(|e| self.fail(e))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        self.check_open()?;
        let notify = self
            .core
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| Arc::clone(&q.notify));
        let Some(notify) = notify else {
            return Err(self.fail(BrokerError::NotFound(format!("no queue '{queue}'"))));
        };

        debug!(queue = %queue, consumer = %consumer_tag, channel = self.id, "In-memory consumer registered");

        let active = Arc::new(AtomicBool::new(true));
        self.consumers.lock().insert(
            consumer_tag.to_string(),
            (Arc::clone(&active), Arc::clone(&notify)),
        );

        let cursor = Cursor {
            core: Arc::clone(&self.core),
            channel_id: self.id,
            open: Arc::clone(&self.open),
            active,
            queue: queue.to_string(),
            notify,
            prefetch: self.prefetch,
            buffer: VecDeque::new(),
        };
        Ok(Box::pin(stream::unfold(cursor, |mut cursor| async move {
            let delivery = cursor.next().await?;
            Some((Ok(delivery), cursor))
        })))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.check_open()?;
        if let Some((active, notify)) = self.consumers.lock().remove(consumer_tag) {
            active.store(false, Ordering::SeqCst);
            notify.notify_waiters();
            debug!(consumer = %consumer_tag, channel = self.id, "In-memory consumer cancelled");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.core.close_connection(self.id);
        Ok(())
    }
}

/// Pull side of one subscription. Takes messages ahead of the reader up to
/// the prefetch limit, the way a network client buffers them.
struct Cursor {
    core: Arc<Core>,
    channel_id: u64,
    open: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
    queue: String,
    notify: Arc<Notify>,
    prefetch: usize,
    buffer: VecDeque<Delivery>,
}

impl Cursor {
    /// After a cancel, yields what is buffered and then ends.
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            let notify = Arc::clone(&self.notify);
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.open.load(Ordering::SeqCst) {
                // Closing the channel requeued everything buffered.
                self.buffer.clear();
                return None;
            }
            let active = self.active.load(Ordering::SeqCst);
            if active {
                while let Some(delivery) = self.core.take(self.channel_id, &self.queue, self.prefetch) {
                    self.buffer.push_back(delivery);
                }
            }
            if let Some(delivery) = self.buffer.pop_front() {
                return Some(delivery);
            }
            if !active {
                return None;
            }
            notified.await;
        }
    }
}

struct InMemoryAcker {
    core: Arc<Core>,
    queue: String,
    tag: u64,
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.core.settle(&self.queue, self.tag, Settlement::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        let outcome = if requeue {
            Settlement::Requeue
        } else {
            Settlement::Discard
        };
        self.core.settle(&self.queue, self.tag, outcome)
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.nack(requeue).await
    }
}
