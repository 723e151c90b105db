//! Decoding of gateway envelopes into message halves.
//!
//! The gateway logs every request and every response as a separate JSON envelope:
//!
//! ```json
//! {
//!   "event_type": "request",
//!   "message-id": "5f1c7b52-7c1d-4d0c-9a4a-8d1e0b3f5a11",
//!   "method": "post",
//!   "uri": "https://api.example.com/orders",
//!   "user_id": "u1",
//!   "company_id": "c1",
//!   "request_headers": "content-type:application/json;;x-api-key:abc",
//!   "request_body": "eyJpZCI6MX0=",
//!   "metadata": {"region": "eu"}
//! }
//! ```
//!
//! Response envelopes carry `status_code`, `response_headers` and `response_body` instead.

use chrono::{DateTime, Utc};
use indexmap::map::Entry;
use serde::Deserialize;
use serde_json::Value;

use crate::message::{
    Body, CorrelationId, Headers, MessageHalf, MetadataValue, RequestHalf, ResponseHalf,
};

/// An error decoding a single envelope.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The payload is not JSON or does not have the shape of an envelope.
    #[error("malformed envelope")]
    Malformed(#[from] serde_json::Error),
    /// A required field is missing or empty.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(&'static str),
    /// The status code is not an integer in the range of HTTP status codes.
    #[error("invalid status code {0}")]
    InvalidStatusCode(Value),
    /// The timestamp is not a valid RFC 3339 date.
    #[error("invalid timestamp")]
    InvalidTimestamp(#[source] chrono::ParseError),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Envelope {
    event_type: Option<String>,
    #[serde(rename = "message-id")]
    message_id: Option<String>,
    timestamp: Option<String>,
    method: Option<String>,
    uri: Option<String>,
    user_id: Option<String>,
    company_id: Option<String>,
    request_headers: Option<String>,
    request_body: Option<String>,
    metadata: Option<Value>,
    status_code: Option<Value>,
    response_headers: Option<String>,
    response_body: Option<String>,
}

/// Splits an ingest payload into its envelopes.
///
/// The payload is either a single envelope or a JSON array of envelopes.
pub fn split_envelopes(payload: &[u8]) -> Result<Vec<Value>, DecodeError> {
    match serde_json::from_slice(payload)? {
        Value::Array(envelopes) => Ok(envelopes),
        envelope => Ok(vec![envelope]),
    }
}

/// Decodes one envelope into a message half.
///
/// `received_at` becomes the timestamp of the half unless the envelope carries its own
/// `timestamp`.
pub fn decode_envelope(
    envelope: Value,
    received_at: DateTime<Utc>,
) -> Result<MessageHalf, DecodeError> {
    let envelope = Envelope::deserialize(envelope)?;

    let id = match envelope.message_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => CorrelationId::new(id),
        _ => return Err(DecodeError::InvalidEnvelope("missing message-id")),
    };

    let timestamp = match envelope.timestamp.as_deref() {
        Some(timestamp) => DateTime::parse_from_rfc3339(timestamp)
            .map_err(DecodeError::InvalidTimestamp)?
            .with_timezone(&Utc),
        None => received_at,
    };

    match envelope.event_type.as_deref() {
        Some("request") => Ok(MessageHalf::Request(RequestHalf {
            id,
            timestamp,
            method: envelope.method.unwrap_or_default().trim().to_uppercase(),
            uri: envelope.uri.unwrap_or_default().trim().to_owned(),
            headers: parse_headers(envelope.request_headers.as_deref().unwrap_or_default()),
            body: Body::base64(envelope.request_body.unwrap_or_default()),
            user_id: non_empty(envelope.user_id),
            company_id: non_empty(envelope.company_id),
            metadata: match envelope.metadata {
                Some(Value::Object(map)) => map
                    .into_iter()
                    .map(|(key, value)| (key, MetadataValue::from(value)))
                    .collect(),
                Some(Value::Null) | None => Default::default(),
                Some(_) => return Err(DecodeError::InvalidEnvelope("metadata is not an object")),
            },
        })),
        Some("response") => Ok(MessageHalf::Response(ResponseHalf {
            id,
            timestamp,
            status_code: parse_status_code(envelope.status_code)?,
            headers: parse_headers(envelope.response_headers.as_deref().unwrap_or_default()),
            body: Body::base64(envelope.response_body.unwrap_or_default()),
        })),
        Some("") | None => Err(DecodeError::InvalidEnvelope("missing event_type")),
        Some(_) => Err(DecodeError::InvalidEnvelope("unknown event_type")),
    }
}

/// Parses headers serialized by the gateway as `name:value` entries separated by `;;`.
///
/// Entries without a colon or with an empty name are skipped. Values of repeated names are
/// combined with `", "`.
pub fn parse_headers(raw: &str) -> Headers {
    let mut headers = Headers::new();

    for entry in raw.split(";;") {
        let Some((name, value)) = entry.split_once(':') else {
            continue;
        };

        let name = name.trim();
        if name.is_empty() {
            continue;
        }

        let value = value.trim();
        match headers.entry(name.to_owned()) {
            Entry::Occupied(mut entry) => {
                let combined = entry.get_mut();
                combined.push_str(", ");
                combined.push_str(value);
            }
            Entry::Vacant(entry) => {
                entry.insert(value.to_owned());
            }
        }
    }

    headers
}

fn parse_status_code(value: Option<Value>) -> Result<u16, DecodeError> {
    let Some(value) = value else {
        return Err(DecodeError::InvalidEnvelope("missing status_code"));
    };

    let status_code = match &value {
        Value::Number(number) => number.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(string) => string.trim().parse().ok(),
        _ => None,
    };

    status_code.ok_or(DecodeError::InvalidStatusCode(value))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}
