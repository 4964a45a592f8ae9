//! Turns whatever the hub pushed (a structured object, a JSON-encoded string
//! or plain free text) into one [`NormalizedEvent`].
//!
//! Normalization is total: every input produces an event and nothing here
//! panics or performs I/O.

use crate::routes::{EventRoute, builtin_routes};
use chrono::{DateTime, SecondsFormat};
use core_types::{Exchange, NormalizedEvent};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

const MESSAGE_KEYS: [&str; 4] = ["message", "msg", "text", "content"];
const TIMESTAMP_KEYS: [&str; 5] = ["timestamp", "time", "ts", "createdAt", "created_at"];
const EXCHANGE_KEYS: [&str; 2] = ["exchange", "floor"];
const COUNT_KEY: &str = "count";

/// "42 stocks", "1 stock".
static COUNT_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?i)\b(\d+)\s+stocks?\b").ok());

/// Normalizes `raw` using the built-in route for `event_name`.
pub fn normalize(raw: &Value, event_name: &str) -> NormalizedEvent {
    normalize_routed(raw, event_name, &builtin_routes().resolve(event_name))
}

/// Normalizes `raw` with a route resolved by the caller.
pub fn normalize_routed(raw: &Value, event_name: &str, route: &EventRoute) -> NormalizedEvent {
    match raw {
        Value::Object(fields) => from_object(fields, event_name, route),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(fields)) => from_object(&fields, event_name, route),
            _ => from_text(text, event_name, route),
        },
        other => NormalizedEvent::new(
            event_name,
            other.to_string(),
            route.exchange.unwrap_or(Exchange::Unknown),
        ),
    }
}

fn from_object(fields: &Map<String, Value>, event_name: &str, route: &EventRoute) -> NormalizedEvent {
    let message = find_field(fields, &MESSAGE_KEYS).and_then(|(key, value)| text_of(value).map(|text| (key, text)));
    let timestamp =
        find_field(fields, &TIMESTAMP_KEYS).and_then(|(key, value)| timestamp_of(value).map(|ts| (key, ts)));

    let exchange = route
        .exchange
        .or_else(|| {
            find_field(fields, &EXCHANGE_KEYS)
                .and_then(|(_, value)| value.as_str())
                .and_then(|code| code.parse::<Exchange>().ok())
        })
        .unwrap_or(Exchange::Unknown);

    let message_key = message.as_ref().map(|(key, _)| key.as_str());
    let timestamp_key = timestamp.as_ref().map(|(key, _)| key.as_str());
    let extra: Map<String, Value> = fields
        .iter()
        .filter(|(key, _)| Some(key.as_str()) != message_key && Some(key.as_str()) != timestamp_key)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let message = match message {
        Some((_, text)) => text,
        None => Value::Object(fields.clone()).to_string(),
    };
    let count = find_field(fields, &[COUNT_KEY])
        .and_then(|(_, value)| count_of(value))
        .or_else(|| count_in(&message));

    let mut event = NormalizedEvent::new(event_name, message, exchange);
    if let Some((_, ts)) = timestamp {
        event.timestamp = ts;
    }
    event.count = count;
    event.extra = extra;
    event
}

fn from_text(text: &str, event_name: &str, route: &EventRoute) -> NormalizedEvent {
    let exchange = route.exchange.unwrap_or_else(|| {
        if event_name.contains("HNX") || text.contains("HNX") {
            Exchange::Hnx
        } else {
            Exchange::Hsx
        }
    });
    let mut event = NormalizedEvent::new(event_name, text, exchange);
    event.count = count_in(text);
    event
}

/// The first field matching a candidate key (in candidate order), ignoring case.
fn find_field<'a>(fields: &'a Map<String, Value>, candidates: &[&str]) -> Option<(&'a String, &'a Value)> {
    candidates.iter().find_map(|candidate| {
        fields
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(candidate))
    })
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

/// Strings are kept verbatim; numbers are epoch milliseconds.
fn timestamp_of(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|ms| ms as i64))
            .and_then(DateTime::from_timestamp_millis)
            .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
        _ => None,
    }
}

fn count_of(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn count_in(text: &str) -> Option<u64> {
    COUNT_PATTERN
        .as_ref()?
        .captures(text)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}
