//! # Entities
//!
//! Application entities that ride inside an envelope. The transport never
//! sees these types; they live here because several services share them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, DefaultOnNull};

/// Severity of a user-facing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum EventLevel {
    #[default]
    Info,
    Warning,
    Error,
}

impl TryFrom<i8> for EventLevel {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, String> {
        match value {
            0 => Ok(Self::Info),
            1 => Ok(Self::Warning),
            2 => Ok(Self::Error),
            other => Err(format!("unknown event level {other}")),
        }
    }
}

impl From<EventLevel> for i8 {
    fn from(level: EventLevel) -> Self {
        match level {
            EventLevel::Info => 0,
            EventLevel::Warning => 1,
            EventLevel::Error => 2,
        }
    }
}

/// A user-facing event (notification, audit line, alert).
///
/// Either `code` is set and the consumer renders title/message from it, or
/// `title`/`message` carry the text directly.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Event {
    pub username: String,
    pub level: EventLevel,
    pub event_date: DateTime<Utc>,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    /// Named parameters. Producers that omit them send `null`.
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

impl Event {
    /// An event identified by a message code, rendered by the consumer.
    pub fn from_code(
        username: impl Into<String>,
        code: impl Into<String>,
        parameters: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            username: username.into(),
            level: EventLevel::Info,
            event_date: Utc::now(),
            code: code.into(),
            title: String::new(),
            message: String::new(),
            parameters,
        }
    }

    /// An event with explicit text.
    pub fn with_text(
        username: impl Into<String>,
        level: EventLevel,
        title: impl Into<String>,
        message: impl Into<String>,
        parameters: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            username: username.into(),
            level,
            event_date: Utc::now(),
            code: String::new(),
            title: title.into(),
            message: message.into(),
            parameters,
        }
    }
}
