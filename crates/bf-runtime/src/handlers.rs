//! Handlers behind the standard queues.
//!
//! - `bf.system.events:notifier`: typed [`Event`]s, logged at their level
//! - `bf.inventory.updates:portfolio`: any JSON entity, logged and accepted
//! - `bf.dead.letter:store`: kept in a bounded [`DeadLetterStore`]

use std::collections::VecDeque;

use async_trait::async_trait;
use bf_bus::{DispatchError, DispatchTable, EnvelopeHandler, Verdict};
use bf_envelope::{Envelope, Event, EventLevel, MessageKind};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::topology::SOURCE_EVENT;

/// Default number of dead letters kept in memory.
pub const DEAD_LETTER_CAPACITY: usize = 1_000;

/// Routes of the notifier queue.
///
/// # Errors
///
/// `DispatchError` if the table does not cover `("event", Create)`.
pub fn notifier_table() -> Result<DispatchTable, DispatchError> {
    let table = DispatchTable::builder()
        .on(SOURCE_EVENT, MessageKind::Create, |event: Event| async move {
            log_event(&event);
            Verdict::Accept
        })
        .build()?;
    table.validate_covers(&[(SOURCE_EVENT, MessageKind::Create)])?;
    Ok(table)
}

fn log_event(event: &Event) {
    let text = if event.code.is_empty() {
        event.title.as_str()
    } else {
        event.code.as_str()
    };
    match event.level {
        EventLevel::Info => info!(
            username = %event.username,
            date = %event.event_date,
            params = event.parameters.len(),
            "Event: {text}"
        ),
        EventLevel::Warning => warn!(
            username = %event.username,
            date = %event.event_date,
            params = event.parameters.len(),
            "Event: {text}"
        ),
        EventLevel::Error => error!(
            username = %event.username,
            date = %event.event_date,
            params = event.parameters.len(),
            "Event: {text}"
        ),
    }
}

/// Accepts inventory updates whose entity is JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct InventoryUpdates;

#[async_trait]
impl EnvelopeHandler for InventoryUpdates {
    async fn handle(&self, envelope: &Envelope) -> Verdict {
        match envelope.entity_as::<Value>() {
            Ok(entity) => {
                debug!(
                    source = %envelope.source,
                    kind = %envelope.kind,
                    entity = %entity,
                    "Inventory update"
                );
                Verdict::Accept
            }
            Err(e) => {
                warn!(
                    source = %envelope.source,
                    kind = %envelope.kind,
                    error = %e,
                    "Inventory update entity is not JSON, discarding"
                );
                Verdict::Discard
            }
        }
    }
}

/// A message that exhausted its redeliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub envelope: Envelope,
    pub stored_at: DateTime<Utc>,
}

/// Keeps the most recent dead letters. Oldest entries are evicted first.
#[derive(Debug)]
pub struct DeadLetterStore {
    capacity: usize,
    entries: Mutex<VecDeque<DeadLetter>>,
}

impl Default for DeadLetterStore {
    fn default() -> Self {
        Self::new(DEAD_LETTER_CAPACITY)
    }
}

impl DeadLetterStore {
    /// A capacity of zero is treated as one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(DEAD_LETTER_CAPACITY))),
        }
    }

    /// Oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<DeadLetter> {
        self.entries.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn store(&self, envelope: Envelope) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            if let Some(evicted) = entries.pop_front() {
                warn!(
                    source = %evicted.envelope.source,
                    kind = %evicted.envelope.kind,
                    "Dead-letter store full, evicting the oldest entry"
                );
            }
        }
        entries.push_back(DeadLetter {
            envelope,
            stored_at: Utc::now(),
        });
    }
}

#[async_trait]
impl EnvelopeHandler for DeadLetterStore {
    async fn handle(&self, envelope: &Envelope) -> Verdict {
        warn!(
            source = %envelope.source,
            kind = %envelope.kind,
            bytes = envelope.entity.len(),
            "Dead letter received"
        );
        self.store(envelope.clone());
        Verdict::Accept
    }
}
