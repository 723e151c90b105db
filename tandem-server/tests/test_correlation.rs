use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::{Value, json};
use tandem_sampling::SamplingConfig;
use tandem_server::batch::{BatchAssembler, EventOptions, EventRecord};
use tandem_server::cache::CorrelationCache;
use tandem_server::decode;
use tandem_server::message::{MessageHalf, MetadataValue};
use tandem_server::pipeline::Pipeline;
use tandem_server::services::sampling_config::{
    SamplingConfigHandle, SamplingConfigOptions, SamplingConfigService,
};
use tandem_server::upstream::{
    ConfigSource, EventSink, FetchError, FetchedConfig, SinkError,
};
use tandem_system::Controller;

const ETAG_HEADER: &str = "x-config-etag";

#[derive(Default)]
struct MemorySink {
    records: Mutex<Vec<EventRecord>>,
}

impl MemorySink {
    fn user_ids(&self) -> Vec<Option<String>> {
        self.records
            .lock()
            .iter()
            .map(|record| record.user_id.clone())
            .collect()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn deliver(&self, batch: Vec<EventRecord>) -> Result<(), SinkError> {
        self.records.lock().extend(batch);
        Ok(())
    }
}

/// Serves canned configuration payloads in order.
struct CannedSource {
    payloads: Mutex<VecDeque<(&'static str, Value)>>,
    calls: AtomicUsize,
}

impl CannedSource {
    fn new(payloads: impl IntoIterator<Item = (&'static str, Value)>) -> Arc<Self> {
        Arc::new(Self {
            payloads: Mutex::new(payloads.into_iter().collect()),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ConfigSource for CannedSource {
    async fn fetch(&self) -> Result<FetchedConfig, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (etag, body) = self
            .payloads
            .lock()
            .pop_front()
            .ok_or(FetchError::Status(StatusCode::SERVICE_UNAVAILABLE))?;

        Ok(FetchedConfig {
            headers: vec![(ETAG_HEADER.to_owned(), etag.to_owned())],
            body: Bytes::from(body.to_string()),
        })
    }
}

fn start_sampling(
    source: Arc<CannedSource>,
    refresh_interval: Duration,
    controller: &Controller,
) -> SamplingConfigHandle {
    let options = SamplingConfigOptions {
        refresh_interval,
        fetch_timeout: Duration::from_secs(5),
        etag_header: ETAG_HEADER.to_owned(),
    };

    SamplingConfigService::new(source, options, controller.shutdown_handle()).start_handle()
}

fn pipeline(sampling: SamplingConfigHandle, sink: Arc<MemorySink>) -> Pipeline {
    Pipeline::new(
        Arc::new(CorrelationCache::new()),
        BatchAssembler::new(sampling, EventOptions::default()),
        sink,
    )
}

fn request(id: &str, user_id: &str) -> MessageHalf {
    let envelope = json!({
        "event_type": "request",
        "message-id": id,
        "method": "post",
        "uri": "https://api.example.com/orders",
        "user_id": user_id,
        "request_headers": "content-type:application/json",
        "request_body": "eyJpZCI6MX0=",
    });

    decode::decode_envelope(envelope, Utc::now()).unwrap()
}

fn response(id: &str) -> MessageHalf {
    let envelope = json!({
        "event_type": "response",
        "message-id": id,
        "status_code": 201,
        "response_body": "",
    });

    decode::decode_envelope(envelope, Utc::now()).unwrap()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_user_override_with_fetched_config() {
    let controller = Controller::new(Duration::from_secs(1));
    let source = CannedSource::new([(
        "v1",
        json!({"sample_rate": 0, "user_sample_rate": {"u1": 100}}),
    )]);
    let sampling = start_sampling(source, Duration::from_secs(300), &controller);
    settle().await;
    assert_eq!(sampling.current().etag.as_deref(), Some("v1"));

    let sink = Arc::new(MemorySink::default());
    let pipeline = pipeline(sampling, sink.clone());

    pipeline.ingest(request("a", "u1")).await.unwrap();
    pipeline.ingest(response("a")).await.unwrap();
    pipeline.ingest(response("b")).await.unwrap();
    pipeline.ingest(request("b", "u2")).await.unwrap();

    assert_eq!(sink.user_ids(), [Some("u1".to_owned())]);

    let records = sink.records.lock();
    assert_eq!(records[0].weight, 1);
    assert_eq!(records[0].request.verb, "POST");
    assert_eq!(records[0].request.body, Some(json!({"id": 1})));
    assert_eq!(records[0].response.status, 201);
    assert_eq!(
        records[0].metadata.get("correlation_id"),
        Some(&MetadataValue::from("a"))
    );
}

#[tokio::test]
async fn test_orphan_response_is_never_emitted() {
    let sampling = SamplingConfigHandle::fixed(SamplingConfig::sample_all(Utc::now()));
    let sink = Arc::new(MemorySink::default());
    let pipeline = pipeline(sampling, sink.clone());

    pipeline.ingest(response("orphan")).await.unwrap();
    pipeline.ingest(request("other", "u1")).await.unwrap();

    assert!(sink.records.lock().is_empty());
    let pending = pipeline.cache().pending();
    assert_eq!((pending.requests, pending.responses), (1, 1));

    pipeline.ingest(response("other")).await.unwrap();
    assert_eq!(sink.records.lock().len(), 1);
    assert_eq!(pipeline.cache().pending().responses, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ingest_delivers_each_pair_once() {
    const PAIRS: usize = 500;

    let sampling = SamplingConfigHandle::fixed(SamplingConfig::sample_all(Utc::now()));
    let sink = Arc::new(MemorySink::default());
    let pipeline = Arc::new(pipeline(sampling, sink.clone()));

    let mut tasks = Vec::new();
    for i in 0..PAIRS {
        let id = format!("id-{i}");
        let mut halves = vec![request(&id, "u1"), response(&id)];
        if i % 2 == 0 {
            halves.reverse();
        }

        for half in halves {
            let pipeline = pipeline.clone();
            tasks.push(tokio::spawn(async move { pipeline.ingest(half).await }));
        }
    }

    let mut delivered = 0;
    for task in tasks {
        delivered += task.await.unwrap().unwrap().delivered;
    }

    let ids: BTreeSet<_> = sink
        .records
        .lock()
        .iter()
        .map(|record| format!("{:?}", record.metadata["correlation_id"]))
        .collect();

    assert_eq!(delivered, PAIRS);
    assert_eq!(sink.records.lock().len(), PAIRS);
    assert_eq!(ids.len(), PAIRS);
    assert!(pipeline.cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stale_config_is_refreshed_from_the_hot_path() {
    let controller = Controller::new(Duration::from_secs(1));
    let source = CannedSource::new([
        ("v1", json!({"sample_rate": 0})),
        ("v2", json!({"sample_rate": 100})),
    ]);
    let sampling = start_sampling(source.clone(), Duration::from_secs(60), &controller);
    settle().await;

    let sink = Arc::new(MemorySink::default());
    let pipeline = pipeline(sampling.clone(), sink.clone());

    pipeline.ingest(request("a", "u1")).await.unwrap();
    pipeline.ingest(response("a")).await.unwrap();
    assert!(sink.records.lock().is_empty());

    tokio::time::sleep(Duration::from_secs(61)).await;

    // Sampled with the stale snapshot, which triggers the refresh.
    pipeline.ingest(request("b", "u1")).await.unwrap();
    pipeline.ingest(response("b")).await.unwrap();
    assert!(sink.records.lock().is_empty());

    settle().await;
    assert_eq!(sampling.current().etag.as_deref(), Some("v2"));
    assert_eq!(source.calls.load(Ordering::SeqCst), 2);

    pipeline.ingest(request("c", "u1")).await.unwrap();
    pipeline.ingest(response("c")).await.unwrap();
    assert_eq!(sink.user_ids(), [Some("u1".to_owned())]);
}

#[tokio::test]
async fn test_invalid_envelopes_are_rejected() {
    let payload = json!([
        {"event_type": "request", "method": "get"},
        {"event_type": "response", "message-id": "a", "status_code": "ok"},
        {"event_type": "unknown", "message-id": "a"},
    ]);

    let envelopes = decode::split_envelopes(payload.to_string().as_bytes()).unwrap();
    assert_eq!(envelopes.len(), 3);

    for envelope in envelopes {
        assert!(decode::decode_envelope(envelope, Utc::now()).is_err());
    }
}
