use crate::enums::Exchange;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The canonical shape every hub payload is normalized into before it reaches
/// consumers. Constructed per incoming message and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// The wire event name the payload arrived on.
    pub event: String,
    pub message: String,
    /// ISO-8601 timestamp, kept verbatim when the hub supplied one.
    pub timestamp: String,
    pub exchange: Exchange,
    /// Numeric count derived from the payload (e.g. "42 stocks changed").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    /// Every event-specific field of a structured payload that is not the
    /// message or the timestamp.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl NormalizedEvent {
    pub fn new(event: impl Into<String>, message: impl Into<String>, exchange: Exchange) -> Self {
        Self {
            event: event.into(),
            message: message.into(),
            timestamp: now_iso8601(),
            exchange,
            count: None,
            extra: Map::new(),
        }
    }

    /// Looks up an extra field by name, ignoring ASCII case.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.extra
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    /// Parses the timestamp back into a `DateTime`, if it is valid RFC 3339.
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }
}

/// The current time as an ISO-8601 string with millisecond precision.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
