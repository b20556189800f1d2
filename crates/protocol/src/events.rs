//! Lifecycle event records published to observers.
//!
//! Every event is a flat JSON object with an `event` name, an optional `app`
//! it concerns, a timestamp, optional routing tags and any number of extra
//! fields. The hub routes an event by its tags: the owning application (or
//! [`GENERAL_TAG`] when there is none) followed by the record's own tags.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tag used for events that do not belong to an application.
pub const GENERAL_TAG: &str = "general";

/// Tag used for error replies and failures.
pub const ERRORS_TAG: &str = "errors";

/// A single lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event name, e.g. `app_ready` or `killing_console_program`.
    pub event: String,
    /// Application the event concerns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub time: u64,
    /// Extra routing tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Free-form fields.
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl EventRecord {
    /// Create an event stamped with the current time.
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            app: None,
            time: now_millis(),
            tags: Vec::new(),
            fields: BTreeMap::new(),
        }
    }

    /// Set the owning application.
    pub fn app(mut self, app: impl Into<String>) -> Self {
        self.app = Some(app.into());
        self
    }

    /// Add a routing tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Add a free-form field.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Tags this record should be delivered under.
    pub fn routing_tags(&self) -> Vec<String> {
        let mut tags = Vec::with_capacity(self.tags.len() + 1);
        tags.push(self.app.clone().unwrap_or_else(|| GENERAL_TAG.to_string()));
        tags.extend(self.tags.iter().cloned());
        tags
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from a JSON string.
    pub fn from_json(raw: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
