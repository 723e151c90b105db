//! Ingestion of message halves captured by the gateway.

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{MethodRouter, post};
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tandem_config::Config;
use tandem_statsd::metric;

use crate::decode;
use crate::endpoints::common::BadIngestRequest;
use crate::service::ServiceState;
use crate::statsd::TandemCounters;

#[derive(Debug, Default, Serialize)]
struct IngestResponse {
    /// Envelopes decoded and ingested.
    accepted: usize,
    /// Envelopes that could not be decoded.
    rejected: usize,
    /// Event records delivered to the sink as a result of this request.
    delivered: usize,
}

/// Ingests a single envelope or an array of envelopes in order.
///
/// Envelopes that cannot be decoded are skipped. A failure to deliver aborts the request, so
/// the transport retries it.
async fn handle(
    State(state): State<ServiceState>,
    body: Bytes,
) -> Result<impl IntoResponse, BadIngestRequest> {
    let envelopes = decode::split_envelopes(&body)?;
    let received_at = Utc::now();

    let mut response = IngestResponse::default();
    for envelope in envelopes {
        let half = match decode::decode_envelope(envelope, received_at) {
            Ok(half) => half,
            Err(error) => {
                tandem_log::warn!(
                    error = &error as &dyn std::error::Error,
                    "dropping invalid envelope"
                );
                metric!(counter(TandemCounters::HalvesInvalid) += 1);
                response.rejected += 1;
                continue;
            }
        };

        let outcome = state.pipeline().ingest(half).await?;
        response.accepted += 1;
        response.delivered += outcome.delivered;
    }

    Ok((StatusCode::ACCEPTED, axum::Json(response)))
}

pub fn route(config: &Config) -> MethodRouter<ServiceState> {
    post(handle).route_layer(DefaultBodyLimit::max(config.max_payload_size()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use parking_lot::Mutex;
    use reqwest::StatusCode as UpstreamStatus;
    use serde_json::{Value, json};
    use tandem_sampling::SamplingConfig;
    use tower::ServiceExt;

    use super::*;
    use crate::batch::{BatchAssembler, EventOptions, EventRecord};
    use crate::cache::CorrelationCache;
    use crate::pipeline::Pipeline;
    use crate::services::sampling_config::SamplingConfigHandle;
    use crate::upstream::{EventSink, SinkError};

    #[derive(Default)]
    struct MemorySink {
        records: Mutex<Vec<EventRecord>>,
        fail: bool,
    }

    #[async_trait]
    impl EventSink for MemorySink {
        async fn deliver(&self, batch: Vec<EventRecord>) -> Result<(), SinkError> {
            if self.fail {
                return Err(SinkError::Status(UpstreamStatus::SERVICE_UNAVAILABLE));
            }
            self.records.lock().extend(batch);
            Ok(())
        }
    }

    fn app(sink: Arc<MemorySink>, config: Config) -> axum::Router {
        let sampling = SamplingConfigHandle::fixed(SamplingConfig::sample_all(Utc::now()));
        let pipeline = Pipeline::new(
            Arc::new(CorrelationCache::new()),
            BatchAssembler::new(sampling, EventOptions::default()),
            sink,
        );

        let state = ServiceState::new(Arc::new(config), Arc::new(pipeline));
        crate::endpoints::routes(state.config()).with_state(state)
    }

    async fn post_halves(app: axum::Router, body: impl Into<Body>) -> (StatusCode, Value) {
        let request = Request::post("/api/0/halves")
            .header("content-type", "application/json")
            .body(body.into())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();

        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn envelopes() -> Value {
        json!([
            {
                "event_type": "response",
                "message-id": "m1",
                "status_code": 200,
                "response_body": "",
            },
            {"event_type": "request"},
            {
                "event_type": "request",
                "message-id": "m1",
                "method": "get",
                "uri": "https://api.example.com/",
            },
        ])
    }

    #[tokio::test]
    async fn test_ingest_array() {
        let sink = Arc::new(MemorySink::default());
        let app = app(sink.clone(), Config::default());

        let (status, body) = post_halves(app, envelopes().to_string()).await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, json!({"accepted": 2, "rejected": 1, "delivered": 1}));
        assert_eq!(sink.records.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_sink_failure_is_server_error() {
        let sink = Arc::new(MemorySink {
            fail: true,
            ..Default::default()
        });
        let app = app(sink, Config::default());

        let (status, body) = post_halves(app, envelopes().to_string()).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["detail"], "failed to process halves");
    }

    #[tokio::test]
    async fn test_malformed_payload() {
        let app = app(Arc::new(MemorySink::default()), Config::default());
        let (status, _) = post_halves(app, "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_payload_limit() {
        let config = Config::from_json_value(json!({"limits": {"max_payload_size": 1024}}))
            .unwrap();
        let app = app(Arc::new(MemorySink::default()), config);

        let (status, _) = post_halves(app, format!("\"{}\"", "x".repeat(4096))).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = app(Arc::new(MemorySink::default()), Config::default());
        let request = Request::get("/api/health").body(Body::empty()).unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
