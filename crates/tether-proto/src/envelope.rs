//! The JSON envelope carried by every gateway frame.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::ProtoError;

/// Message type of the client heartbeat.
pub const PING: &str = "ping";

/// Message type a gateway may use to answer a heartbeat.
pub const PONG: &str = "pong";

/// Payload field that carries the correlation id of a request and its reply.
pub const REQUEST_ID_FIELD: &str = "requestId";

/// A single message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type, e.g. `get_launchpad` or `launchpad_response`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque business payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    /// Time the sender produced the message.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_timestamp"
    )]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Create an envelope stamped with the current time.
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp: Some(Utc::now()),
        }
    }

    /// Create a heartbeat ping. It carries no payload.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(PING, Value::Null)
    }

    /// Create a heartbeat pong.
    #[must_use]
    pub fn pong() -> Self {
        Self::new(PONG, Value::Null)
    }

    /// Whether this is a heartbeat ping.
    #[must_use]
    pub fn is_ping(&self) -> bool {
        self.kind == PING
    }

    /// Whether this is a heartbeat pong.
    #[must_use]
    pub fn is_pong(&self) -> bool {
        self.kind == PONG
    }

    /// Correlation id carried in `payload.requestId`, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.payload.get(REQUEST_ID_FIELD).and_then(Value::as_str)
    }

    /// Attach a correlation id to the payload.
    ///
    /// A null payload becomes an object holding only the id.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::PayloadNotObject`] if the payload is a scalar or array.
    pub fn with_request_id(mut self, id: impl Into<String>) -> Result<Self, ProtoError> {
        if self.payload.is_null() {
            self.payload = Value::Object(Map::new());
        }
        match &mut self.payload {
            Value::Object(fields) => {
                fields.insert(REQUEST_ID_FIELD.to_string(), Value::String(id.into()));
                Ok(self)
            }
            other => Err(ProtoError::PayloadNotObject(json_type_name(other))),
        }
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self).map_err(|e| ProtoError::Encoding(e.to_string()))
    }

    /// Deserialize from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not an envelope or its type is empty.
    pub fn from_json(json: &str) -> Result<Self, ProtoError> {
        let envelope: Self =
            serde_json::from_str(json).map_err(|e| ProtoError::Decoding(e.to_string()))?;
        if envelope.kind.is_empty() {
            return Err(ProtoError::MissingField("type"));
        }
        Ok(envelope)
    }
}

// Gateways are not consistent about timestamps; an unreadable one is dropped
// rather than failing the whole frame.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw
        .as_ref()
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc)))
}

const fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test]
    fn test_ping_has_no_payload() {
        let json = Envelope::ping().to_json().expect("encode");
        let value: Value = serde_json::from_str(&json).expect("valid json");

        assert_eq!(value["type"], "ping");
        assert!(value.get("payload").is_none());
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_parse_reply_with_request_id() {
        let raw = r#"{"type":"launchpad_response","payload":{"requestId":"ab12cd","launchpad":{}},"timestamp":"2026-01-01T00:00:00Z"}"#;

        let envelope = Envelope::from_json(raw).expect("should parse");

        assert_eq!(envelope.kind, "launchpad_response");
        assert_eq!(envelope.request_id(), Some("ab12cd"));
        assert!(envelope.timestamp.is_some());
    }

    #[test]
    fn test_parse_without_payload_or_timestamp() {
        let envelope = Envelope::from_json(r#"{"type":"pong"}"#).expect("should parse");
        assert!(envelope.is_pong());
        assert!(envelope.payload.is_null());
        assert!(envelope.timestamp.is_none());
        assert_eq!(envelope.request_id(), None);
    }

    #[test]
    fn test_unreadable_timestamp_is_ignored() {
        let envelope =
            Envelope::from_json(r#"{"type":"tick","timestamp":1700000000}"#).expect("should parse");
        assert!(envelope.timestamp.is_none());
    }

    #[test_case("not json" ; "garbage")]
    #[test_case("[1,2,3]" ; "array")]
    #[test_case(r#"{"payload":{}}"# ; "missing type")]
    #[test_case(r#"{"type":42}"# ; "numeric type")]
    fn test_malformed_frames_rejected(raw: &str) {
        let err = Envelope::from_json(raw).expect_err("should fail");
        assert!(matches!(err, ProtoError::Decoding(_)));
    }

    #[test]
    fn test_empty_type_rejected() {
        let err = Envelope::from_json(r#"{"type":""}"#).expect_err("should fail");
        assert_eq!(err, ProtoError::MissingField("type"));
    }

    #[test]
    fn test_with_request_id_on_object_payload() {
        let envelope = Envelope::new("get_launchpad", json!({"userId": "u1"}))
            .with_request_id("ab12cd")
            .expect("object payload");

        assert_eq!(envelope.payload, json!({"userId": "u1", "requestId": "ab12cd"}));
    }

    #[test]
    fn test_with_request_id_on_null_payload() {
        let envelope = Envelope::new("list", Value::Null)
            .with_request_id("r1")
            .expect("null payload");
        assert_eq!(envelope.request_id(), Some("r1"));
    }

    #[test_case(json!([1, 2]), "array")]
    #[test_case(json!("text"), "string")]
    #[test_case(json!(7), "number")]
    fn test_with_request_id_rejects_non_object(payload: Value, name: &'static str) {
        let err = Envelope::new("x", payload)
            .with_request_id("r1")
            .expect_err("should fail");
        assert_eq!(err, ProtoError::PayloadNotObject(name));
    }
}
