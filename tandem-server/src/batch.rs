//! Conversion of joined transactions into sampled event records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use data_encoding::BASE64;
use serde::Serialize;
use serde_json::Value;
use tandem_config::Config;
use tandem_sampling::{SamplingConfig, SamplingDecision};
use tandem_statsd::metric;

use crate::message::{Body, CorrelationPair, Headers, MetadataValue};
use crate::services::sampling_config::SamplingConfigHandle;
use crate::statsd::TandemCounters;

/// Metadata key under which the correlation id is attached to every record.
pub const CORRELATION_ID_KEY: &str = "correlation_id";

/// Marks a body that is carried as base64 text instead of JSON.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferEncoding {
    /// Base64 with the standard alphabet and padding.
    Base64,
}

/// The request attributes of an [`EventRecord`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EventRequest {
    /// The time the request was captured.
    pub time: DateTime<Utc>,
    /// The full request URI.
    pub uri: String,
    /// The HTTP method.
    pub verb: String,
    /// Request headers.
    pub headers: Headers,
    /// The version of the API, if configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// The address of the client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// The payload, either as JSON or as base64 text.
    pub body: Option<Value>,
    /// Set if `body` is base64 text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_encoding: Option<TransferEncoding>,
}

/// The response attributes of an [`EventRecord`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EventResponse {
    /// The time the response completed.
    pub time: DateTime<Utc>,
    /// The HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: Headers,
    /// The address of the responding server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// The payload, either as JSON or as base64 text.
    pub body: Option<Value>,
    /// Set if `body` is base64 text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_encoding: Option<TransferEncoding>,
}

/// A complete, sampled transaction as sent to the sink.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EventRecord {
    /// Request attributes.
    pub request: EventRequest,
    /// Response attributes.
    pub response: EventResponse,
    /// The user that issued the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// The company of the user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    /// The session token taken from the request headers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    /// Request metadata, including the correlation id.
    pub metadata: BTreeMap<String, MetadataValue>,
    /// The number of transactions this record stands for.
    pub weight: u32,
}

/// Static options applied to every record.
#[derive(Clone, Debug, Default)]
pub struct EventOptions {
    /// Copied into the `api_version` of every request.
    pub api_version: Option<String>,
    /// Name of the request header holding the session token, matched case-insensitively.
    pub session_token_header: Option<String>,
}

impl EventOptions {
    /// Reads the event options from the configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            api_version: config.api_version().map(str::to_owned),
            session_token_header: config.session_token_header().map(str::to_owned),
        }
    }
}

/// A joined pair that cannot be turned into an event record.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// The request has no method.
    #[error("request method is empty")]
    EmptyMethod,
    /// The request URI is not an absolute URL.
    #[error("request uri is not an absolute url")]
    InvalidUri(#[source] url::ParseError),
    /// The status code is not a valid HTTP status.
    #[error("invalid response status code {0}")]
    InvalidStatusCode(u16),
}

impl EventRecord {
    /// Builds a record with a weight of 1 from a joined pair.
    pub fn from_pair(pair: CorrelationPair, options: &EventOptions) -> Result<Self, RecordError> {
        let CorrelationPair { request, response } = pair;

        if request.method.is_empty() {
            return Err(RecordError::EmptyMethod);
        }
        url::Url::parse(&request.uri).map_err(RecordError::InvalidUri)?;
        if !(100..=599).contains(&response.status_code) {
            return Err(RecordError::InvalidStatusCode(response.status_code));
        }

        let session_token = options.session_token_header.as_deref().and_then(|name| {
            request
                .headers
                .iter()
                .find(|(header, _)| header.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.clone())
        });

        let mut metadata = request.metadata;
        metadata.insert(
            CORRELATION_ID_KEY.to_owned(),
            MetadataValue::String(request.id.to_string()),
        );

        let (request_body, request_encoding) = encode_body(&request.body);
        let (response_body, response_encoding) = encode_body(&response.body);

        Ok(Self {
            request: EventRequest {
                time: request.timestamp,
                uri: request.uri,
                verb: request.method,
                headers: request.headers,
                api_version: options.api_version.clone(),
                ip_address: None,
                body: request_body,
                transfer_encoding: request_encoding,
            },
            response: EventResponse {
                time: response.timestamp,
                status: response.status_code,
                headers: response.headers,
                ip_address: None,
                body: response_body,
                transfer_encoding: response_encoding,
            },
            user_id: request.user_id,
            company_id: request.company_id,
            session_token,
            metadata,
            weight: 1,
        })
    }
}

/// Converts a captured body into the representation sent to the sink.
///
/// JSON documents are sent as JSON, whether captured as plain text or as base64. Everything else
/// is sent as the captured text, tagged as base64.
fn encode_body(body: &Body) -> (Option<Value>, Option<TransferEncoding>) {
    let trimmed = body.data.trim();
    if trimmed.is_empty() {
        return (None, None);
    }

    if let Some(json) = parse_json_document(trimmed) {
        return (Some(json), None);
    }

    // The capture tag is not trusted, so decoding is attempted for every body.
    let decoded = BASE64
        .decode(trimmed.as_bytes())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok());

    if let Some(json) = decoded.as_deref().and_then(|s| parse_json_document(s.trim())) {
        return (Some(json), None);
    }

    (Some(Value::String(body.data.clone())), Some(TransferEncoding::Base64))
}

/// Parses text that looks like a JSON object or array.
///
/// Truncated payloads are common, so failures are expected and not reported.
fn parse_json_document(data: &str) -> Option<Value> {
    let is_document = (data.starts_with('{') && data.ends_with('}'))
        || (data.starts_with('[') && data.ends_with(']'));

    if !is_document {
        return None;
    }

    serde_json::from_str(data).ok()
}

/// Turns joined pairs into sampled event records.
#[derive(Clone, Debug)]
pub struct BatchAssembler {
    sampling: SamplingConfigHandle,
    options: EventOptions,
}

impl BatchAssembler {
    /// Creates an assembler sampling against the given configuration.
    pub fn new(sampling: SamplingConfigHandle, options: EventOptions) -> Self {
        Self { sampling, options }
    }

    /// Builds and samples records for all pairs.
    ///
    /// All pairs of a batch are sampled against the same configuration snapshot. Pairs that
    /// cannot be turned into a record are logged and skipped without affecting the rest of the
    /// batch.
    pub fn assemble(&self, pairs: Vec<CorrelationPair>) -> Vec<EventRecord> {
        if pairs.is_empty() {
            return Vec::new();
        }

        let config = self.sampling.current();
        pairs
            .into_iter()
            .filter_map(|pair| self.assemble_one(pair, &config))
            .collect()
    }

    fn assemble_one(&self, pair: CorrelationPair, config: &SamplingConfig) -> Option<EventRecord> {
        let id = pair.id().clone();

        let mut record = match EventRecord::from_pair(pair, &self.options) {
            Ok(record) => record,
            Err(error) => {
                tandem_log::warn!(
                    error = &error as &dyn std::error::Error,
                    correlation_id = %id,
                    "skipping invalid transaction"
                );
                metric!(counter(TandemCounters::EventsInvalid) += 1);
                return None;
            }
        };

        let decision = SamplingDecision::evaluate(
            Some(config),
            record.user_id.as_deref(),
            record.company_id.as_deref(),
        );
        self.sampling.refresh_if_stale();

        if decision.should_drop() {
            tandem_log::debug!(
                correlation_id = %id,
                sample_rate = decision.sample_rate,
                "skipping transaction excluded by sampling"
            );
            metric!(counter(TandemCounters::EventsSampled) += 1, decision = "drop");
            return None;
        }

        metric!(counter(TandemCounters::EventsSampled) += 1, decision = "keep");
        record.weight = decision.weight;
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::TimeZone;
    use similar_asserts::assert_eq;
    use tandem_sampling::SampleRate;

    use super::*;
    use crate::message::{RequestHalf, ResponseHalf};

    fn time(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, second).unwrap()
    }

    fn pair(id: &str, user_id: Option<&str>) -> CorrelationPair {
        CorrelationPair {
            request: RequestHalf {
                id: id.into(),
                timestamp: time(0),
                method: "POST".to_owned(),
                uri: "https://api.example.com/orders".to_owned(),
                headers: Headers::from([
                    ("Content-Type".to_owned(), "application/json".to_owned()),
                    ("X-Session".to_owned(), "tok".to_owned()),
                ]),
                body: Body::base64(BASE64.encode(br#"{"id": 1}"#)),
                user_id: user_id.map(str::to_owned),
                company_id: None,
                metadata: BTreeMap::from([("region".to_owned(), MetadataValue::from("eu"))]),
            },
            response: ResponseHalf {
                id: id.into(),
                timestamp: time(1),
                status_code: 201,
                headers: Headers::new(),
                body: Body::base64("bm90IGpzb24="),
            },
        }
    }

    fn config(sample_rate: u32, users: &[(&str, u32)]) -> SamplingConfig {
        SamplingConfig {
            sample_rate: SampleRate::new(sample_rate),
            user_sample_rate: users
                .iter()
                .map(|(id, rate)| ((*id).to_owned(), SampleRate::new(*rate)))
                .collect(),
            ..SamplingConfig::sample_all(time(0))
        }
    }

    fn options() -> EventOptions {
        EventOptions {
            api_version: Some("v2".to_owned()),
            session_token_header: Some("x-session".to_owned()),
        }
    }

    #[test]
    fn test_record_shape() {
        let record = EventRecord::from_pair(pair("m1", Some("u1")), &options()).unwrap();

        insta::assert_json_snapshot!(record, @r###"
        {
          "request": {
            "time": "2024-05-01T12:00:00Z",
            "uri": "https://api.example.com/orders",
            "verb": "POST",
            "headers": {
              "Content-Type": "application/json",
              "X-Session": "tok"
            },
            "api_version": "v2",
            "body": {
              "id": 1
            }
          },
          "response": {
            "time": "2024-05-01T12:00:01Z",
            "status": 201,
            "headers": {},
            "body": "bm90IGpzb24=",
            "transfer_encoding": "base64"
          },
          "user_id": "u1",
          "session_token": "tok",
          "metadata": {
            "correlation_id": "m1",
            "region": "eu"
          },
          "weight": 1
        }
        "###);
    }

    #[test]
    fn test_body_raw_json() {
        let (body, encoding) = encode_body(&Body::raw(" [1, 2] "));
        assert_eq!(body, Some(serde_json::json!([1, 2])));
        assert_eq!(encoding, None);
    }

    #[test]
    fn test_body_base64_json() {
        let (body, encoding) = encode_body(&Body::base64("eyJhIjp0cnVlfQ=="));
        assert_eq!(body, Some(serde_json::json!({"a": true})));
        assert_eq!(encoding, None);
    }

    #[test]
    fn test_body_truncated_json_kept_verbatim() {
        let truncated = BASE64.encode(br#"{"a": [1, 2"#);
        let (body, encoding) = encode_body(&Body::base64(truncated.clone()));
        assert_eq!(body, Some(Value::String(truncated)));
        assert_eq!(encoding, Some(TransferEncoding::Base64));
    }

    #[test]
    fn test_body_raw_text_kept_verbatim() {
        let (body, encoding) = encode_body(&Body::raw("hello world"));
        assert_eq!(body, Some(Value::String("hello world".to_owned())));
        assert_eq!(encoding, Some(TransferEncoding::Base64));
    }

    #[test]
    fn test_body_untagged_base64_json() {
        let (body, encoding) = encode_body(&Body::raw("eyJhIjoxfQ=="));
        assert_eq!(body, Some(serde_json::json!({"a": 1})));
        assert_eq!(encoding, None);
    }

    #[test]
    fn test_body_whitespace_preserved() {
        let (body, encoding) = encode_body(&Body::raw("  line one\nline two\n"));
        assert_eq!(body, Some(Value::String("  line one\nline two\n".to_owned())));
        assert_eq!(encoding, Some(TransferEncoding::Base64));
    }

    #[test]
    fn test_body_empty() {
        assert_eq!(encode_body(&Body::base64("")), (None, None));
    }

    #[test]
    fn test_invalid_records() {
        let mut no_method = pair("a", None);
        no_method.request.method.clear();
        assert!(matches!(
            EventRecord::from_pair(no_method, &options()),
            Err(RecordError::EmptyMethod)
        ));

        let mut relative = pair("b", None);
        relative.request.uri = "/orders".to_owned();
        assert!(matches!(
            EventRecord::from_pair(relative, &options()),
            Err(RecordError::InvalidUri(_))
        ));

        let mut bad_status = pair("c", None);
        bad_status.response.status_code = 42;
        assert!(matches!(
            EventRecord::from_pair(bad_status, &options()),
            Err(RecordError::InvalidStatusCode(42))
        ));
    }

    #[test]
    fn test_session_token_missing_header() {
        let options = EventOptions {
            session_token_header: Some("authorization".to_owned()),
            ..Default::default()
        };
        let record = EventRecord::from_pair(pair("a", None), &options).unwrap();
        assert_eq!(record.session_token, None);
        assert_eq!(record.request.api_version, None);
    }

    #[test]
    fn test_assemble_user_at_full_rate() {
        let assembler = BatchAssembler::new(
            SamplingConfigHandle::fixed(config(0, &[("u1", 100)])),
            options(),
        );

        let records = assembler.assemble(vec![pair("a", Some("u1")), pair("b", Some("u2"))]);

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].user_id.as_deref(), Some("u1"));
        assert_eq!(records[0].weight, 1);
    }

    #[test]
    fn test_assemble_skips_bad_pair() {
        let sampling = SamplingConfigHandle::fixed(config(100, &[]));
        let assembler = BatchAssembler::new(sampling, options());

        let mut bad = pair("bad", None);
        bad.response.status_code = 1000;

        let records = assembler.assemble(vec![pair("a", None), bad, pair("b", None)]);
        let ids: Vec<_> = records
            .iter()
            .map(|record| &record.metadata[CORRELATION_ID_KEY])
            .collect();

        assert_eq!(
            ids,
            [&MetadataValue::from("a"), &MetadataValue::from("b")]
        );
    }

    #[test]
    fn test_assemble_rate_zero_drops_everything() {
        let assembler = BatchAssembler::new(SamplingConfigHandle::fixed(config(0, &[])), options());
        let pairs = (0..50).map(|i| pair(&i.to_string(), None)).collect();
        assert!(assembler.assemble(pairs).is_empty());
    }
}
