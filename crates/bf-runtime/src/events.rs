//! User-facing events.
//!
//! Any service can raise an event for a user; the notifier renders and
//! delivers it. Events travel on [`EX_EVENT`] as `("event", Create)`
//! envelopes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bf_bus::{MessagePublisher, PublishError};
use bf_envelope::{Envelope, Event, EventLevel, MessageKind};
use serde_json::Value;
use tracing::debug;

use crate::topology::{EX_EVENT, SOURCE_EVENT};

/// Publishes [`Event`]s.
#[derive(Clone)]
pub struct EventSender {
    publisher: Arc<dyn MessagePublisher>,
}

impl EventSender {
    pub fn new(publisher: Arc<dyn MessagePublisher>) -> Self {
        Self { publisher }
    }

    /// Event with explicit title and message.
    ///
    /// # Errors
    ///
    /// The publish error; the event is not buffered.
    pub async fn send_event(
        &self,
        username: &str,
        level: EventLevel,
        title: &str,
        message: &str,
        parameters: BTreeMap<String, Value>,
    ) -> Result<(), PublishError> {
        self.publish(Event::with_text(username, level, title, message, parameters))
            .await
    }

    /// Event identified by a message code, at `Info` level.
    ///
    /// # Errors
    ///
    /// The publish error; the event is not buffered.
    pub async fn send_event_by_code(
        &self,
        username: &str,
        code: &str,
        parameters: BTreeMap<String, Value>,
    ) -> Result<(), PublishError> {
        self.publish(Event::from_code(username, code, parameters)).await
    }

    async fn publish(&self, event: Event) -> Result<(), PublishError> {
        let envelope = Envelope::wrap(SOURCE_EVENT, MessageKind::Create, &event).map_err(|cause| {
            PublishError::Serialization {
                exchange: EX_EVENT.to_string(),
                cause,
            }
        })?;
        debug!(username = %event.username, code = %event.code, "Sending event");
        self.publisher.send_envelope(EX_EVENT, envelope).await
    }
}

impl fmt::Debug for EventSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSender").finish_non_exhaustive()
    }
}
