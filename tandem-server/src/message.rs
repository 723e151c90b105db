//! The message model of the correlation pipeline.
//!
//! Every HTTP transaction arrives as two independent [`MessageHalf`]s sharing a
//! [`CorrelationId`]. Once both halves are present, the correlation cache joins them into a
//! [`CorrelationPair`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;

/// Header names mapped to their combined values, in the order they were first seen.
pub type Headers = IndexMap<String, String>;

/// Identifier shared by the request and response half of one transaction.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Creates a correlation id from its string representation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// The side of a transaction a half belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HalfKind {
    /// The request, sent by the client.
    Request,
    /// The response, returned by the server.
    Response,
}

impl HalfKind {
    /// Returns the name of the kind, as used in metric tags.
    pub fn as_str(self) -> &'static str {
        match self {
            HalfKind::Request => "request",
            HalfKind::Response => "response",
        }
    }
}

impl fmt::Display for HalfKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the data of a [`Body`] is encoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BodyEncoding {
    /// Plain text.
    #[default]
    Raw,
    /// Base64 with the standard alphabet and padding.
    Base64,
}

/// The captured payload of a request or response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Body {
    /// The payload as captured.
    pub data: String,
    /// The encoding of `data`.
    pub encoding: BodyEncoding,
}

impl Body {
    /// Creates a plain text body.
    pub fn raw(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            encoding: BodyEncoding::Raw,
        }
    }

    /// Creates a body from base64 encoded data.
    pub fn base64(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            encoding: BodyEncoding::Base64,
        }
    }

    /// Returns `true` if the body holds no data besides whitespace.
    pub fn is_empty(&self) -> bool {
        self.data.trim().is_empty()
    }
}

/// A value in the open metadata mapping of a request.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetadataValue {
    /// An explicit `null`.
    Null,
    /// A boolean.
    Bool(bool),
    /// An integer or floating point number.
    Number(serde_json::Number),
    /// A string.
    String(String),
    /// A list of values.
    Array(Vec<MetadataValue>),
    /// A nested mapping, sorted by key.
    Object(BTreeMap<String, MetadataValue>),
}

impl From<serde_json::Value> for MetadataValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(s),
            Value::Array(values) => Self::Array(values.into_iter().map(Self::from).collect()),
            Value::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

/// The request side of a transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestHalf {
    /// The id shared with the response.
    pub id: CorrelationId,
    /// The time the request was captured.
    pub timestamp: DateTime<Utc>,
    /// The upper-case HTTP method.
    pub method: String,
    /// The full request URI.
    pub uri: String,
    /// Request headers.
    pub headers: Headers,
    /// The request payload.
    pub body: Body,
    /// The user issuing the request, if known.
    pub user_id: Option<String>,
    /// The company of the user, if known.
    pub company_id: Option<String>,
    /// Arbitrary metadata attached by the gateway.
    pub metadata: BTreeMap<String, MetadataValue>,
}

/// The response side of a transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseHalf {
    /// The id shared with the request.
    pub id: CorrelationId,
    /// The time the response completed.
    pub timestamp: DateTime<Utc>,
    /// The HTTP status code.
    pub status_code: u16,
    /// Response headers.
    pub headers: Headers,
    /// The response payload.
    pub body: Body,
}

/// One side of a transaction, delivered independently of the other.
#[derive(Clone, Debug, PartialEq)]
pub enum MessageHalf {
    /// A request half.
    Request(RequestHalf),
    /// A response half.
    Response(ResponseHalf),
}

impl MessageHalf {
    /// Returns the correlation id of this half.
    pub fn id(&self) -> &CorrelationId {
        match self {
            MessageHalf::Request(request) => &request.id,
            MessageHalf::Response(response) => &response.id,
        }
    }

    /// Returns the kind of this half.
    pub fn kind(&self) -> HalfKind {
        match self {
            MessageHalf::Request(_) => HalfKind::Request,
            MessageHalf::Response(_) => HalfKind::Response,
        }
    }
}

impl From<RequestHalf> for MessageHalf {
    fn from(request: RequestHalf) -> Self {
        Self::Request(request)
    }
}

impl From<ResponseHalf> for MessageHalf {
    fn from(response: ResponseHalf) -> Self {
        Self::Response(response)
    }
}

/// A request and response joined by their correlation id.
#[derive(Clone, Debug, PartialEq)]
pub struct CorrelationPair {
    /// The request half.
    pub request: RequestHalf,
    /// The response half, with the same id as the request.
    pub response: ResponseHalf,
}

impl CorrelationPair {
    /// Returns the shared correlation id.
    pub fn id(&self) -> &CorrelationId {
        &self.request.id
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_metadata_from_json() {
        let value = MetadataValue::from(json!({
            "b": [1, "two", null],
            "a": {"nested": true},
        }));

        assert_eq!(
            serde_json::to_string(&value).unwrap(),
            r#"{"a":{"nested":true},"b":[1,"two",null]}"#
        );
    }

    #[test]
    fn test_body_is_empty() {
        assert!(Body::raw("  \n").is_empty());
        assert!(!Body::base64("e30=").is_empty());
    }
}
