#![forbid(unsafe_code)]

// Wire protocol - envelope parsing, server frames, error codes

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Upper bound for `requestId` and `idempotencyKey` (bytes).
pub const MAX_CORRELATION_LEN: usize = 128;
/// Upper bound for trimmed chat text (bytes).
pub const MAX_CHAT_BYTES: usize = 20_000;
/// Bounds for opaque call-signal blobs (serialized bytes).
pub const MIN_SIGNAL_BYTES: usize = 2;
pub const MAX_SIGNAL_BYTES: usize = 12_000;

// Close codes for ticket failures during the WebSocket handshake.
pub const CLOSE_TICKET_MISSING: u16 = 4001;
pub const CLOSE_TICKET_INVALID: u16 = 4002;
pub const CLOSE_TICKET_CORRUPT: u16 = 4003;
pub const CLOSE_TICKET_NO_SUBJECT: u16 = 4004;

/// Client-to-server envelope shell.
///
/// The `type` tag is kept as a plain string and the payload as raw JSON so
/// that an unknown event type can be nacked with `UnknownEvent` (correlated
/// to the requestId) instead of failing the whole frame as malformed.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event: String,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

/// Why an inbound frame was rejected before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    Unparsable,
    MissingType,
    PayloadNotObject,
    CorrelationTooLong,
}

impl FrameError {
    pub fn message(self) -> &'static str {
        match self {
            Self::Unparsable => "frame is not a JSON object",
            Self::MissingType => "missing or empty type field",
            Self::PayloadNotObject => "payload must be a JSON object",
            Self::CorrelationTooLong => "requestId/idempotencyKey exceeds 128 bytes",
        }
    }
}

/// Parse and validate a raw text frame into an envelope.
pub fn parse_envelope(text: &str) -> Result<Envelope, FrameError> {
    let envelope: Envelope = serde_json::from_str(text).map_err(|_| FrameError::Unparsable)?;
    if envelope.event.trim().is_empty() {
        return Err(FrameError::MissingType);
    }
    if let Some(payload) = &envelope.payload {
        if !payload.is_object() {
            return Err(FrameError::PayloadNotObject);
        }
    }
    for field in [&envelope.request_id, &envelope.idempotency_key] {
        if let Some(value) = field {
            if value.len() > MAX_CORRELATION_LEN {
                return Err(FrameError::CorrelationTooLong);
            }
        }
    }
    Ok(envelope)
}

/// Machine-readable nack codes, serialized as their variant names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    UnknownEvent,
    RoomNotFound,
    Forbidden,
    TargetNotInRoom,
    ValidationError,
    NoActiveRoom,
    ServerError,
}

/// A negative acknowledgement to be correlated back to the client.
#[derive(Debug, Clone)]
pub struct Nack {
    pub code: ErrorCode,
    pub message: String,
}

impl Nack {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

// --- Typed inbound payloads ---

/// Decode an envelope's payload into the per-event struct. A missing
/// payload decodes as an empty object so events with all-optional fields
/// still parse.
pub fn decode_payload<T: serde::de::DeserializeOwned>(envelope: &Envelope) -> Result<T, Nack> {
    let payload = envelope
        .payload
        .clone()
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    serde_json::from_value(payload)
        .map_err(|e| Nack::new(ErrorCode::ValidationError, format!("invalid payload: {e}")))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub room: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendPayload {
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    #[serde(default)]
    pub target_user_id: Option<String>,
    pub signal: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HangupPayload {
    #[serde(default)]
    pub target_user_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicStatePayload {
    #[serde(default)]
    pub target_user_id: Option<String>,
    pub muted: bool,
}

// --- Server-to-client frames ---

/// Serialize a server frame as `{ "type": ..., "payload": ... }`.
/// Frames are pre-serialized once and shared across recipients.
pub fn frame(event: &str, payload: Value) -> Arc<String> {
    Arc::new(json!({ "type": event, "payload": payload }).to_string())
}

pub fn ack_frame(request_id: &str, event_type: &str, meta: Value) -> Arc<String> {
    frame(
        "ack",
        json!({
            "requestId": request_id,
            "eventType": event_type,
            "serverTime": Utc::now(),
            "meta": meta,
        }),
    )
}

pub fn nack_frame(request_id: Option<&str>, event_type: &str, nack: &Nack) -> Arc<String> {
    frame(
        "nack",
        json!({
            "requestId": request_id,
            "eventType": event_type,
            "code": nack.code,
            "message": nack.message,
        }),
    )
}

pub fn error_frame(message: &str) -> Arc<String> {
    frame("error", json!({ "message": message }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_envelope() {
        let env = parse_envelope(
            r#"{"type":"chat.send","requestId":"r1","idempotencyKey":"k1","payload":{"text":"hi"}}"#,
        )
        .unwrap();
        assert_eq!(env.event, "chat.send");
        assert_eq!(env.request_id.as_deref(), Some("r1"));
        assert_eq!(env.idempotency_key.as_deref(), Some("k1"));
    }

    #[test]
    fn rejects_unparsable_body() {
        assert!(matches!(parse_envelope("not json"), Err(FrameError::Unparsable)));
    }

    #[test]
    fn rejects_missing_and_empty_type() {
        assert!(matches!(
            parse_envelope(r#"{"payload":{}}"#),
            Err(FrameError::Unparsable)
        ));
        assert!(matches!(
            parse_envelope(r#"{"type":"  "}"#),
            Err(FrameError::MissingType)
        ));
    }

    #[test]
    fn rejects_non_object_payload() {
        assert!(matches!(
            parse_envelope(r#"{"type":"ping","payload":[1,2]}"#),
            Err(FrameError::PayloadNotObject)
        ));
    }

    #[test]
    fn rejects_oversized_request_id() {
        let long = "x".repeat(MAX_CORRELATION_LEN + 1);
        let raw = format!(r#"{{"type":"ping","requestId":"{long}"}}"#);
        assert!(matches!(
            parse_envelope(&raw),
            Err(FrameError::CorrelationTooLong)
        ));
    }

    #[test]
    fn payload_is_optional() {
        let env = parse_envelope(r#"{"type":"ping"}"#).unwrap();
        assert!(env.payload.is_none());
        assert!(env.request_id.is_none());
    }

    #[test]
    fn error_codes_serialize_as_names() {
        let json = serde_json::to_string(&ErrorCode::TargetNotInRoom).unwrap();
        assert_eq!(json, "\"TargetNotInRoom\"");
    }

    #[test]
    fn ack_frame_shape() {
        let raw = ack_frame("r1", "chat.send", json!({ "messageId": "m1" }));
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "ack");
        assert_eq!(value["payload"]["requestId"], "r1");
        assert_eq!(value["payload"]["eventType"], "chat.send");
        assert_eq!(value["payload"]["meta"]["messageId"], "m1");
        assert!(value["payload"]["serverTime"].is_string());
    }

    #[test]
    fn nack_frame_carries_code_and_message() {
        let nack = Nack::new(ErrorCode::NoActiveRoom, "join a room first");
        let raw = nack_frame(Some("r9"), "chat.send", &nack);
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["payload"]["code"], "NoActiveRoom");
        assert_eq!(value["payload"]["requestId"], "r9");
        assert_eq!(value["payload"]["message"], "join a room first");
    }

    #[test]
    fn close_codes_are_distinct() {
        let codes = [
            CLOSE_TICKET_MISSING,
            CLOSE_TICKET_INVALID,
            CLOSE_TICKET_CORRUPT,
            CLOSE_TICKET_NO_SUBJECT,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
