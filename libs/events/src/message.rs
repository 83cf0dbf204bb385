//! Engine event wire model.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::EventError;

/// Object type an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Container,
    Image,
    Network,
    Volume,
    Daemon,
    #[serde(other)]
    Other,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Container => "container",
            EventKind::Image => "image",
            EventKind::Network => "network",
            EventKind::Volume => "volume",
            EventKind::Daemon => "daemon",
            EventKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// The object an event is about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    #[serde(rename = "ID", default)]
    pub id: String,

    #[serde(rename = "Attributes", default)]
    pub attributes: HashMap<String, String>,
}

/// One message from the engine event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "Type")]
    pub kind: EventKind,

    #[serde(rename = "Action")]
    pub action: String,

    #[serde(rename = "Actor", default)]
    pub actor: Actor,

    /// Unix timestamp (seconds).
    #[serde(default)]
    pub time: i64,
}

impl EngineEvent {
    /// Build an event, mostly useful for tests and mocks.
    pub fn new(kind: EventKind, action: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind,
            action: action.into(),
            actor: Actor {
                id: id.into(),
                attributes: HashMap::new(),
            },
            time: Utc::now().timestamp(),
        }
    }

    /// Add an actor attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.actor.attributes.insert(key.into(), value.into());
        self
    }

    /// Decode one line of the event stream.
    pub fn from_json(line: &[u8]) -> Result<Self, EventError> {
        Ok(serde_json::from_slice(line)?)
    }

    /// Actor attribute, empty string when absent.
    pub fn attribute(&self, key: &str) -> &str {
        self.actor
            .attributes
            .get(key)
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.time, 0)
    }
}
