//! The JSON hub protocol spoken over the socket.
//!
//! Every record is a JSON text terminated by the ASCII record separator
//! (`0x1E`); a single WebSocket frame may carry several records. The first
//! exchange on a fresh socket is the handshake, after which records carry a
//! numeric `type`.

use crate::error::TransportError;
use serde::Deserialize;
use serde_json::{Value, json};

pub const RECORD_SEPARATOR: char = '\u{1e}';

const INVOCATION: u8 = 1;
const COMPLETION: u8 = 3;
const PING: u8 = 6;
const CLOSE: u8 = 7;

/// A decoded hub record.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    Completion {
        invocation_id: String,
        result: Value,
        error: Option<String>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Stream items and other record types this client does not use.
    Other(u8),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    kind: u8,
    invocation_id: Option<String>,
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    result: Option<Value>,
    error: Option<String>,
    #[serde(default)]
    allow_reconnect: bool,
}

#[derive(Debug, Deserialize)]
struct HandshakeResponse {
    error: Option<String>,
}

/// The first record a client sends on a new socket.
pub fn handshake_request() -> String {
    frame(json!({ "protocol": "json", "version": 1 }))
}

/// Interprets the server's first record; an `error` field means rejection.
pub fn parse_handshake_response(record: &str) -> Result<(), TransportError> {
    let response: HandshakeResponse = serde_json::from_str(record)
        .map_err(|e| TransportError::Protocol(format!("invalid handshake response: {}", e)))?;
    match response.error {
        Some(error) => Err(TransportError::HandshakeRejected(error)),
        None => Ok(()),
    }
}

/// Splits a frame into its records, dropping the empty tail after the last separator.
pub fn split_records(frame: &str) -> impl Iterator<Item = &str> {
    frame
        .split(RECORD_SEPARATOR)
        .filter(|record| !record.trim().is_empty())
}

pub fn parse_message(record: &str) -> Result<HubMessage, TransportError> {
    let raw: RawMessage =
        serde_json::from_str(record).map_err(|e| TransportError::Protocol(e.to_string()))?;

    let message = match raw.kind {
        INVOCATION => HubMessage::Invocation {
            invocation_id: raw.invocation_id,
            target: raw.target.ok_or_else(|| {
                TransportError::Protocol("invocation without a target".to_string())
            })?,
            arguments: raw.arguments,
        },
        COMPLETION => HubMessage::Completion {
            invocation_id: raw.invocation_id.ok_or_else(|| {
                TransportError::Protocol("completion without an invocationId".to_string())
            })?,
            result: raw.result.unwrap_or(Value::Null),
            error: raw.error,
        },
        PING => HubMessage::Ping,
        CLOSE => HubMessage::Close {
            error: raw.error,
            allow_reconnect: raw.allow_reconnect,
        },
        other => HubMessage::Other(other),
    };
    Ok(message)
}

pub fn encode_invocation(invocation_id: &str, target: &str, arguments: &[Value]) -> String {
    frame(json!({
        "type": INVOCATION,
        "invocationId": invocation_id,
        "target": target,
        "arguments": arguments,
    }))
}

pub fn encode_ping() -> String {
    frame(json!({ "type": PING }))
}

pub fn encode_close() -> String {
    frame(json!({ "type": CLOSE }))
}

fn frame(value: Value) -> String {
    let mut text = value.to_string();
    text.push(RECORD_SEPARATOR);
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_request_is_terminated() {
        let request = handshake_request();
        assert!(request.ends_with(RECORD_SEPARATOR));
        let body: Value = serde_json::from_str(request.trim_end_matches(RECORD_SEPARATOR)).unwrap();
        assert_eq!(body["protocol"], "json");
        assert_eq!(body["version"], 1);
    }

    #[test]
    fn handshake_error_is_a_rejection() {
        assert!(parse_handshake_response("{}").is_ok());
        assert_eq!(
            parse_handshake_response(r#"{"error":"Unauthorized"}"#),
            Err(TransportError::HandshakeRejected("Unauthorized".into()))
        );
        assert!(matches!(
            parse_handshake_response("not json"),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn frames_may_carry_several_records() {
        let frame = "{}\u{1e}{\"type\":6}\u{1e}";
        let records: Vec<&str> = split_records(frame).collect();
        assert_eq!(records, vec!["{}", "{\"type\":6}"]);
    }

    #[test]
    fn parses_each_message_kind() {
        let invocation = parse_message(
            r#"{"type":1,"target":"ReceiveHSXStockUpdate","arguments":["tick",2]}"#,
        )
        .unwrap();
        assert_eq!(
            invocation,
            HubMessage::Invocation {
                invocation_id: None,
                target: "ReceiveHSXStockUpdate".into(),
                arguments: vec![json!("tick"), json!(2)],
            }
        );

        let completion = parse_message(r#"{"type":3,"invocationId":"7","result":{"ok":true}}"#).unwrap();
        assert_eq!(
            completion,
            HubMessage::Completion {
                invocation_id: "7".into(),
                result: json!({"ok": true}),
                error: None,
            }
        );

        assert_eq!(parse_message(r#"{"type":6}"#).unwrap(), HubMessage::Ping);
        assert_eq!(
            parse_message(r#"{"type":7,"error":"bye","allowReconnect":true}"#).unwrap(),
            HubMessage::Close {
                error: Some("bye".into()),
                allow_reconnect: true
            }
        );
        assert_eq!(parse_message(r#"{"type":2}"#).unwrap(), HubMessage::Other(2));
    }

    #[test]
    fn invocation_without_target_is_malformed() {
        assert!(matches!(
            parse_message(r#"{"type":1,"arguments":[]}"#),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn encodes_outbound_invocations() {
        let text = encode_invocation("3", "JoinGroup", &[json!("HSX")]);
        let value: Value = serde_json::from_str(text.trim_end_matches(RECORD_SEPARATOR)).unwrap();
        assert_eq!(value["type"], 1);
        assert_eq!(value["invocationId"], "3");
        assert_eq!(value["target"], "JoinGroup");
        assert_eq!(value["arguments"], json!(["HSX"]));
    }
}
