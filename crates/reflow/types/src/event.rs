//! Events: the unit of communication on the bus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Subscription type matching every event
pub const WILDCARD: &str = "*";

/// A typed notification. Immutable once emitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Event type, e.g. `process.state_changed`
    #[serde(rename = "type")]
    pub event_type: String,
    /// Arbitrary payload
    #[serde(default)]
    pub payload: Value,
    /// Emission time. Filled in by the bus when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Component that produced the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            payload: Value::Null,
            timestamp: None,
            source: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Fill in defaults the bus guarantees to handlers
    pub fn normalized(mut self) -> Self {
        if self.timestamp.is_none() {
            self.timestamp = Some(Utc::now());
        }
        self
    }

    pub fn is_wildcard(&self) -> bool {
        self.event_type == WILDCARD
    }
}
