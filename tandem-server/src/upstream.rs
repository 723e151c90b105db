//! Communication with the collector.
//!
//! The pipeline only depends on the [`ConfigSource`] and [`EventSink`] traits. The
//! [`UpstreamConfigSource`] and [`UpstreamSink`] implement them over HTTP.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use tandem_config::{Config, ConfigError};
use url::Url;

use crate::batch::EventRecord;

/// A sampling configuration payload as returned by the collector.
#[derive(Clone, Debug, Default)]
pub struct FetchedConfig {
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// The raw response body.
    pub body: Bytes,
}

impl FetchedConfig {
    /// Iterates over the headers as string slices.
    pub fn header_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

/// An error fetching the sampling configuration.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The collector rejected the application id.
    #[error("unauthorized: check the application id ({0})")]
    Unauthorized(StatusCode),
    /// The collector responded with an error status.
    #[error("collector responded with {0}")]
    Status(StatusCode),
    /// The request could not be sent or the response could not be read.
    #[error("could not send request to collector")]
    Send(#[source] reqwest::Error),
    /// The fetch did not complete in time.
    #[error("fetching the sampling configuration timed out")]
    Timeout,
    /// The fetch task panicked or was cancelled.
    #[error("fetching the sampling configuration did not complete")]
    Aborted(#[source] tokio::task::JoinError),
}

impl FetchError {
    /// Returns the value of the `result` tag of the fetch metric.
    pub fn metric_tag(&self) -> &'static str {
        match self {
            FetchError::Unauthorized(_) => "unauthorized",
            FetchError::Status(_) | FetchError::Send(_) | FetchError::Aborted(_) => "failure",
            FetchError::Timeout => "timeout",
        }
    }
}

/// The remote source of the sampling configuration.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Fetches the current configuration payload.
    async fn fetch(&self) -> Result<FetchedConfig, FetchError>;
}

/// An error delivering a batch of event records.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The request could not be sent.
    #[error("could not send batch to collector")]
    Send(#[source] reqwest::Error),
    /// The collector responded with an error status.
    #[error("collector responded with {0}")]
    Status(StatusCode),
    /// The batch could not be serialized.
    #[error("could not serialize batch")]
    Serialize(#[source] serde_json::Error),
}

/// The downstream consumer of sampled event records.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Delivers a batch of event records in one call.
    async fn deliver(&self, batch: Vec<EventRecord>) -> Result<(), SinkError>;
}

/// Builds the HTTP client shared by all upstream requests.
pub fn create_client(config: &Config) -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(config.http_timeout())
        .connect_timeout(config.http_connection_timeout())
        .user_agent(concat!("tandem/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// The application id header attached to every upstream request.
#[derive(Clone, Debug)]
struct Credentials {
    header: String,
    application_id: String,
}

impl Credentials {
    fn from_config(config: &Config) -> Self {
        Self {
            header: config.application_id_header().to_owned(),
            application_id: config.application_id().unwrap_or_default().to_owned(),
        }
    }
}

/// Fetches the sampling configuration from the collector.
#[derive(Clone, Debug)]
pub struct UpstreamConfigSource {
    client: Client,
    url: Url,
    credentials: Credentials,
}

impl UpstreamConfigSource {
    /// Creates a source for the configuration endpoint of the configured upstream.
    pub fn new(client: Client, config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            client,
            url: config.config_url()?,
            credentials: Credentials::from_config(config),
        })
    }
}

#[async_trait]
impl ConfigSource for UpstreamConfigSource {
    async fn fetch(&self) -> Result<FetchedConfig, FetchError> {
        let response = self
            .client
            .get(self.url.clone())
            .header(
                self.credentials.header.as_str(),
                self.credentials.application_id.as_str(),
            )
            .send()
            .await
            .map_err(FetchError::Send)?;

        let status = response.status();
        if matches!(
            status,
            StatusCode::UNAUTHORIZED | StatusCode::PAYMENT_REQUIRED | StatusCode::FORBIDDEN
        ) {
            return Err(FetchError::Unauthorized(status));
        }
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }

        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                let value = value.to_str().ok()?;
                Some((name.as_str().to_owned(), value.to_owned()))
            })
            .collect();

        let body = response.bytes().await.map_err(FetchError::Send)?;

        Ok(FetchedConfig { headers, body })
    }
}

/// Delivers batches of event records to the collector.
#[derive(Clone, Debug)]
pub struct UpstreamSink {
    client: Client,
    url: Url,
    credentials: Credentials,
}

impl UpstreamSink {
    /// Creates a sink for the batch endpoint of the configured upstream.
    pub fn new(client: Client, config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            client,
            url: config.batch_url()?,
            credentials: Credentials::from_config(config),
        })
    }
}

#[async_trait]
impl EventSink for UpstreamSink {
    async fn deliver(&self, batch: Vec<EventRecord>) -> Result<(), SinkError> {
        let body = serde_json::to_vec(&batch).map_err(SinkError::Serialize)?;

        let response = self
            .client
            .post(self.url.clone())
            .header(
                self.credentials.header.as_str(),
                self.credentials.application_id.as_str(),
            )
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(SinkError::Send)?;

        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Status(status));
        }

        Ok(())
    }
}
