//! JSON hub protocol: handshake and record framing.
//!
//! Every record is a JSON object terminated by [`RECORD_SEPARATOR`]. A frame
//! may carry several records, and a record may in principle span frames, so
//! incoming text goes through a [`RecordBuffer`].
//!
//! Message types handled here:
//!
//! | type | meaning      | direction        |
//! |------|--------------|------------------|
//! | 1    | Invocation   | both             |
//! | 3    | Completion   | server → client  |
//! | 6    | Ping         | both             |
//! | 7    | Close        | both             |
//!
//! Streaming messages (2, 4, 5) are recognised but not supported.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::constants::{PROTOCOL_NAME, PROTOCOL_VERSION, RECORD_SEPARATOR};

/// A decoded hub protocol message.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum HubMessage {
    /// Server calls a client method.
    Invocation {
        /// Present when the server expects a client result.
        invocation_id: Option<String>,
        /// Client method name.
        target: String,
        /// Positional arguments.
        arguments: Vec<Value>,
    },
    /// Result of a client invocation.
    Completion {
        /// Id of the invocation being completed.
        invocation_id: String,
        /// Returned value (`null` when the method returns nothing).
        result: Value,
        /// Error message when the hub method threw.
        error: Option<String>,
    },
    /// Keep-alive.
    Ping,
    /// Server is closing the connection.
    Close {
        /// Reason, when the close was caused by an error.
        error: Option<String>,
        /// Whether the client may reconnect.
        allow_reconnect: bool,
    },
    /// A message type this client does not handle.
    Unsupported(u64),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    kind: u64,
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

/// Accumulates frame text and yields complete records.
#[derive(Debug, Default)]
pub(crate) struct RecordBuffer {
    pending: String,
}

impl RecordBuffer {
    /// Append received text.
    pub(crate) fn push(&mut self, text: &str) {
        self.pending.push_str(text);
    }

    /// Take the next complete record, without its separator.
    pub(crate) fn next_record(&mut self) -> Option<String> {
        loop {
            let end = self.pending.find(RECORD_SEPARATOR)?;
            let record: String = self.pending.drain(..=end).collect();
            let record = record.trim_end_matches(RECORD_SEPARATOR);
            if !record.trim().is_empty() {
                return Some(record.to_string());
            }
        }
    }

    /// Whether a partial record is buffered.
    #[cfg(test)]
    pub(crate) fn has_partial(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// The handshake request record.
pub(crate) fn handshake_request() -> String {
    frame(&json!({ "protocol": PROTOCOL_NAME, "version": PROTOCOL_VERSION }))
}

/// Validate the handshake response record.
pub(crate) fn parse_handshake_response(record: &str) -> Result<()> {
    let response: HandshakeResponse =
        serde_json::from_str(record).context("invalid handshake response")?;
    if let Some(error) = response.error {
        bail!("handshake rejected by server: {error}");
    }
    Ok(())
}

/// Encode a client → server invocation.
pub(crate) fn invocation(invocation_id: &str, target: &str, arguments: &[Value]) -> String {
    frame(&json!({
        "type": 1,
        "invocationId": invocation_id,
        "target": target,
        "arguments": arguments,
    }))
}

/// Encode a ping.
pub(crate) fn ping() -> String {
    frame(&json!({ "type": 6 }))
}

/// Encode a client close.
pub(crate) fn close() -> String {
    frame(&json!({ "type": 7 }))
}

/// Decode one record.
pub(crate) fn parse_message(record: &str) -> Result<HubMessage> {
    let raw: RawMessage = serde_json::from_str(record).context("invalid hub message")?;
    let message = match raw.kind {
        1 => HubMessage::Invocation {
            invocation_id: raw.invocation_id,
            target: raw.target.context("invocation without target")?,
            arguments: raw.arguments,
        },
        3 => HubMessage::Completion {
            invocation_id: raw.invocation_id.context("completion without invocationId")?,
            result: raw.result.unwrap_or(Value::Null),
            error: raw.error,
        },
        6 => HubMessage::Ping,
        7 => HubMessage::Close {
            error: raw.error,
            allow_reconnect: raw.allow_reconnect,
        },
        other => HubMessage::Unsupported(other),
    };
    Ok(message)
}

fn frame(value: &Value) -> String {
    let mut record = value.to_string();
    record.push(RECORD_SEPARATOR);
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_request_is_terminated() {
        let record = handshake_request();
        assert!(record.ends_with(RECORD_SEPARATOR));
        let value: Value = serde_json::from_str(record.trim_end_matches(RECORD_SEPARATOR)).unwrap();
        assert_eq!(value, json!({"protocol": "json", "version": 1}));
    }

    #[test]
    fn test_handshake_response() {
        parse_handshake_response("{}").unwrap();
        let err = parse_handshake_response(r#"{"error":"Requested protocol 'json' is not available."}"#)
            .unwrap_err();
        assert!(err.to_string().contains("not available"));
        assert!(parse_handshake_response("not json").is_err());
    }

    #[test]
    fn test_record_buffer_splits_and_keeps_partial() {
        let mut buffer = RecordBuffer::default();
        buffer.push("{}\u{1e}{\"type\":6}\u{1e}{\"type\"");

        assert_eq!(buffer.next_record().as_deref(), Some("{}"));
        assert_eq!(buffer.next_record().as_deref(), Some("{\"type\":6}"));
        assert_eq!(buffer.next_record(), None);
        assert!(buffer.has_partial());

        buffer.push(":7}\u{1e}");
        assert_eq!(buffer.next_record().as_deref(), Some("{\"type\":7}"));
        assert!(!buffer.has_partial());
    }

    #[test]
    fn test_parse_invocation() {
        let message =
            parse_message(r#"{"type":1,"target":"ReceiveMessage","arguments":["ann",42]}"#).unwrap();
        assert_eq!(
            message,
            HubMessage::Invocation {
                invocation_id: None,
                target: "ReceiveMessage".into(),
                arguments: vec![json!("ann"), json!(42)],
            }
        );
    }

    #[test]
    fn test_parse_completion_variants() {
        assert_eq!(
            parse_message(r#"{"type":3,"invocationId":"4","result":"ok"}"#).unwrap(),
            HubMessage::Completion {
                invocation_id: "4".into(),
                result: json!("ok"),
                error: None,
            }
        );
        assert_eq!(
            parse_message(r#"{"type":3,"invocationId":"5"}"#).unwrap(),
            HubMessage::Completion {
                invocation_id: "5".into(),
                result: Value::Null,
                error: None,
            }
        );
        assert_eq!(
            parse_message(r#"{"type":3,"invocationId":"6","error":"boom"}"#).unwrap(),
            HubMessage::Completion {
                invocation_id: "6".into(),
                result: Value::Null,
                error: Some("boom".into()),
            }
        );
    }

    #[test]
    fn test_parse_close_and_unsupported() {
        assert_eq!(
            parse_message(r#"{"type":7,"error":"shutting down","allowReconnect":true}"#).unwrap(),
            HubMessage::Close {
                error: Some("shutting down".into()),
                allow_reconnect: true,
            }
        );
        assert_eq!(
            parse_message(r#"{"type":2,"invocationId":"1","item":1}"#).unwrap(),
            HubMessage::Unsupported(2)
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_message(r#"{"type":1,"arguments":[]}"#).is_err());
        assert!(parse_message(r#"{"type":3}"#).is_err());
        assert!(parse_message("[]").is_err());
    }

    #[test]
    fn test_invocation_encoding() {
        let record = invocation("0", "SendMessage", &[json!("ann"), json!("hi")]);
        let value: Value = serde_json::from_str(record.trim_end_matches(RECORD_SEPARATOR)).unwrap();
        assert_eq!(
            value,
            json!({"type": 1, "invocationId": "0", "target": "SendMessage", "arguments": ["ann", "hi"]})
        );
        assert!(ping().ends_with(RECORD_SEPARATOR));
        assert!(close().starts_with("{\"type\":7}"));
    }
}
