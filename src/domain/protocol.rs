//! Wire types exchanged between preview clients and conversion workers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Sequence number reserved for the liveness ping sent during bootstrap.
pub const PING_SEQUENCE: u64 = 0;

/// Conversion request issued by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionRequest {
    pub sequence: u64,
    #[serde(default)]
    pub markdown: String,
}

impl ConversionRequest {
    pub fn new(sequence: u64, markdown: impl Into<String>) -> Self {
        Self {
            sequence,
            markdown: markdown.into(),
        }
    }

    pub fn ping() -> Self {
        Self::new(PING_SEQUENCE, String::new())
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|err| ProtocolError::Encode(err.to_string()))
    }
}

/// Reply produced by a worker for exactly one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionResponse {
    /// Echo of the request sequence; `None` when the request could not be read.
    pub sequence: Option<u64>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when the html came from the fallback renderer or the placeholder.
    #[serde(default, skip_serializing_if = "is_false")]
    pub degraded: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl ConversionResponse {
    pub fn rendered(sequence: Option<u64>, html: String, degraded: bool) -> Self {
        Self {
            sequence,
            ok: true,
            html: Some(html),
            error: None,
            degraded,
        }
    }

    pub fn malformed(error: &ProtocolError) -> Self {
        Self {
            sequence: None,
            ok: false,
            html: None,
            error: Some(error.to_string()),
            degraded: false,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|err| ProtocolError::Encode(err.to_string()))
    }

    pub fn decode(payload: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(payload).map_err(|err| ProtocolError::Decode(err.to_string()))
    }
}

/// Payload as delivered to a worker: either already structured or JSON text.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Text(String),
    Structured(Value),
}

/// Request fields as read by the worker. The sequence is optional so a
/// request without one still gets an answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRequest {
    pub sequence: Option<u64>,
    pub markdown: String,
}

impl WorkerMessage {
    /// Decode the message, trying JSON first for text payloads.
    pub fn into_request(self) -> Result<IncomingRequest, ProtocolError> {
        let value = match self {
            WorkerMessage::Text(text) => serde_json::from_str::<Value>(&text)
                .map_err(|err| ProtocolError::Decode(err.to_string()))?,
            WorkerMessage::Structured(value) => value,
        };
        request_from_value(value)
    }
}

fn request_from_value(value: Value) -> Result<IncomingRequest, ProtocolError> {
    let Value::Object(mut fields) = value else {
        return Err(ProtocolError::Shape(
            "request must be an object with `sequence` and `markdown`".to_string(),
        ));
    };

    let sequence = match fields.remove("sequence") {
        None | Some(Value::Null) => None,
        Some(Value::Number(number)) => Some(number.as_u64().ok_or_else(|| {
            ProtocolError::Shape(format!("`sequence` must be a non-negative integer, got {number}"))
        })?),
        Some(other) => {
            return Err(ProtocolError::Shape(format!(
                "`sequence` must be an integer, got {other}"
            )));
        }
    };

    let markdown = match fields.remove("markdown") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text,
        Some(other) => {
            return Err(ProtocolError::Shape(format!(
                "`markdown` must be a string, got {other}"
            )));
        }
    };

    Ok(IncomingRequest { sequence, markdown })
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("request is not valid JSON: {0}")]
    Decode(String),
    #[error("request has an unexpected shape: {0}")]
    Shape(String),
    #[error("message could not be encoded: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_payload_is_decoded_as_json() {
        let message = WorkerMessage::Text(r##"{"sequence":7,"markdown":"# hi"}"##.to_string());
        let request = message.into_request().expect("valid request");
        assert_eq!(request.sequence, Some(7));
        assert_eq!(request.markdown, "# hi");
    }

    #[test]
    fn structured_payload_is_accepted() {
        let message = WorkerMessage::Structured(json!({ "sequence": 3 }));
        let request = message.into_request().expect("valid request");
        assert_eq!(request.sequence, Some(3));
        assert_eq!(request.markdown, "");
    }

    #[test]
    fn non_json_text_is_rejected() {
        let err = WorkerMessage::Text("not json".to_string())
            .into_request()
            .expect_err("not json");
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[test]
    fn non_object_payloads_are_rejected() {
        for value in [json!(42), json!("text"), json!([1, 2])] {
            let err = WorkerMessage::Structured(value)
                .into_request()
                .expect_err("shape error");
            assert!(matches!(err, ProtocolError::Shape(_)));
        }
    }

    #[test]
    fn wrong_field_types_are_rejected() {
        let err = WorkerMessage::Structured(json!({ "sequence": -1, "markdown": "" }))
            .into_request()
            .expect_err("negative sequence");
        assert!(matches!(err, ProtocolError::Shape(_)));

        let err = WorkerMessage::Structured(json!({ "sequence": 1, "markdown": 5 }))
            .into_request()
            .expect_err("numeric markdown");
        assert!(matches!(err, ProtocolError::Shape(_)));
    }

    #[test]
    fn malformed_response_serializes_null_sequence() {
        let response = ConversionResponse::malformed(&ProtocolError::Decode("bad".into()));
        let encoded = response.encode().expect("encode");
        let value: Value = serde_json::from_str(&encoded).expect("json");
        assert_eq!(value["sequence"], Value::Null);
        assert_eq!(value["ok"], Value::Bool(false));
        assert!(value.get("html").is_none());
        assert!(value.get("degraded").is_none());
        assert!(!value["error"].as_str().unwrap_or_default().is_empty());
    }

    #[test]
    fn degraded_flag_is_only_written_when_set() {
        let clean = ConversionResponse::rendered(Some(1), "<p>x</p>".into(), false)
            .encode()
            .expect("encode");
        assert!(!clean.contains("degraded"));

        let degraded = ConversionResponse::rendered(Some(1), "<p>x</p>".into(), true)
            .encode()
            .expect("encode");
        let decoded = ConversionResponse::decode(&degraded).expect("decode");
        assert!(decoded.degraded);
        assert_eq!(decoded.html.as_deref(), Some("<p>x</p>"));
    }
}
