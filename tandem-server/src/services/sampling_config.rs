//! Service keeping the sampling configuration up to date.
//!
//! The [`SamplingConfigService`] is the only writer of the sampling configuration snapshot. Readers
//! use a [`SamplingConfigHandle`], which loads the snapshot without locking and triggers a refresh
//! once the snapshot has become stale.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use tandem_config::Config;
use tandem_sampling::SamplingConfig;
use tandem_statsd::metric;
use tandem_system::{
    Addr, AsyncResponse, FromMessage, Interface, NoResponse, Receiver, Sender, Service,
    ShutdownHandle,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::statsd::{TandemCounters, TandemTimers};
use crate::upstream::{ConfigSource, FetchError, FetchedConfig};

type FetchResult = Result<FetchedConfig, FetchError>;

/// Requests a fetch of the sampling configuration.
///
/// Sent by [`SamplingConfigHandle::refresh_if_stale`] after claiming the refresh.
pub struct Refresh;

/// Requests the current sampling configuration snapshot.
pub struct GetSamplingConfig;

/// Interface of the [`SamplingConfigService`].
pub enum SamplingConfigManager {
    /// Fetches a new configuration from the collector.
    Refresh,
    /// Returns the current snapshot.
    GetSamplingConfig(Sender<Arc<SamplingConfig>>),
}

impl Interface for SamplingConfigManager {}

impl FromMessage<Refresh> for SamplingConfigManager {
    type Response = NoResponse;

    fn from_message(_: Refresh, _: ()) -> Self {
        Self::Refresh
    }
}

impl FromMessage<GetSamplingConfig> for SamplingConfigManager {
    type Response = AsyncResponse<Arc<SamplingConfig>>;

    fn from_message(_: GetSamplingConfig, sender: Sender<Arc<SamplingConfig>>) -> Self {
        Self::GetSamplingConfig(sender)
    }
}

/// Timing and parsing options of the [`SamplingConfigService`].
#[derive(Clone, Debug)]
pub struct SamplingConfigOptions {
    /// Time after which the snapshot is considered stale.
    pub refresh_interval: Duration,
    /// Maximum duration of a single fetch.
    pub fetch_timeout: Duration,
    /// Name of the response header carrying the configuration version.
    pub etag_header: String,
}

impl SamplingConfigOptions {
    /// Reads the sampling options from the configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            refresh_interval: config.sampling_refresh_interval(),
            fetch_timeout: config.sampling_fetch_timeout(),
            etag_header: config.etag_header().to_owned(),
        }
    }
}

/// State shared by the service and its handles.
#[derive(Debug)]
struct Shared {
    snapshot: ArcSwap<SamplingConfig>,
    /// Set while a fetch is requested or running.
    refresh_in_flight: AtomicBool,
    /// Milliseconds since `epoch` at which the last refresh was claimed.
    last_attempt_ms: AtomicU64,
    epoch: Instant,
}

impl Shared {
    fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(SamplingConfig::sample_all(Utc::now())),
            refresh_in_flight: AtomicBool::new(false),
            last_attempt_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Claims the refresh, returning `false` if another refresh is in flight.
    fn try_claim(&self) -> bool {
        let claimed = self
            .refresh_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if claimed {
            self.last_attempt_ms
                .store(self.elapsed_ms(), Ordering::Release);
        }

        claimed
    }

    fn release(&self) {
        self.refresh_in_flight.store(false, Ordering::Release);
    }
}

/// Read access to the sampling configuration for the hot path.
#[derive(Clone, Debug)]
pub struct SamplingConfigHandle {
    shared: Arc<Shared>,
    addr: Addr<SamplingConfigManager>,
    refresh_interval: Duration,
}

impl SamplingConfigHandle {
    /// Creates a handle serving a fixed configuration that is never refreshed.
    pub fn fixed(config: SamplingConfig) -> Self {
        let (addr, _) = tandem_system::channel(SamplingConfigService::name());

        let shared = Shared::new();
        shared.snapshot.store(Arc::new(config));
        shared.refresh_in_flight.store(true, Ordering::Relaxed);

        Self {
            shared: Arc::new(shared),
            addr,
            refresh_interval: Duration::MAX,
        }
    }

    /// Returns the current snapshot without blocking.
    pub fn current(&self) -> Arc<SamplingConfig> {
        self.shared.snapshot.load_full()
    }

    /// Requests a refresh if the last refresh was attempted more than the refresh interval ago.
    ///
    /// At most one refresh is in flight at any time. Returns `true` if this call requested the
    /// refresh.
    pub fn refresh_if_stale(&self) -> bool {
        let last_attempt = self.shared.last_attempt_ms.load(Ordering::Acquire);
        let elapsed = self.shared.elapsed_ms().saturating_sub(last_attempt);

        if u128::from(elapsed) < self.refresh_interval.as_millis() {
            return false;
        }

        if !self.shared.try_claim() {
            return false;
        }

        tandem_log::debug!("sampling config is stale, requesting refresh");
        self.addr.send(Refresh);
        true
    }
}

/// Service fetching the sampling configuration from a [`ConfigSource`].
///
/// The first fetch starts with the service. Later fetches are requested through
/// [`SamplingConfigHandle::refresh_if_stale`]. Failed fetches keep the previous snapshot in effect,
/// while payloads that cannot be parsed are replaced by [`SamplingConfig::fallback`].
pub struct SamplingConfigService {
    source: Arc<dyn ConfigSource>,
    options: SamplingConfigOptions,
    shared: Arc<Shared>,
    /// Sender of the internal channel to forward fetch results.
    internal_tx: mpsc::Sender<FetchResult>,
    /// Receiver of the internal channel to forward fetch results.
    internal_rx: mpsc::Receiver<FetchResult>,
    shutdown_handle: ShutdownHandle,
    /// Disables fetching.
    shutdown: bool,
}

impl SamplingConfigService {
    /// Creates a new [`SamplingConfigService`].
    pub fn new(
        source: Arc<dyn ConfigSource>,
        options: SamplingConfigOptions,
        shutdown_handle: ShutdownHandle,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::channel(1);

        Self {
            source,
            options,
            shared: Arc::new(Shared::new()),
            internal_tx,
            internal_rx,
            shutdown_handle,
            shutdown: false,
        }
    }

    /// Starts the service and returns a handle to its snapshot.
    pub fn start_handle(self) -> SamplingConfigHandle {
        let shared = Arc::clone(&self.shared);
        let refresh_interval = self.options.refresh_interval;
        let addr = self.start();

        SamplingConfigHandle {
            shared,
            addr,
            refresh_interval,
        }
    }

    fn handle_message(&mut self, message: SamplingConfigManager) {
        match message {
            SamplingConfigManager::Refresh => self.request_config(),
            SamplingConfigManager::GetSamplingConfig(sender) => {
                sender.send(self.shared.snapshot.load_full())
            }
        }
    }

    /// Spawns a fetch of the configuration.
    ///
    /// The refresh must have been claimed before.
    fn request_config(&mut self) {
        if self.shutdown {
            return;
        }

        let source = Arc::clone(&self.source);
        let internal_tx = self.internal_tx.clone();
        let fetch_timeout = self.options.fetch_timeout;

        tokio::spawn(async move {
            let result = metric!(timer(TandemTimers::SamplingConfigFetch), {
                // A panicking source must still produce a result, or the refresh stays claimed.
                let mut fetch = tokio::spawn(async move { source.fetch().await });
                match tokio::time::timeout(fetch_timeout, &mut fetch).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(error)) => Err(FetchError::Aborted(error)),
                    Err(_) => {
                        fetch.abort();
                        Err(FetchError::Timeout)
                    }
                }
            });

            // Only fails if the service has stopped.
            internal_tx.send(result).await.ok();
        });
    }

    fn handle_result(&mut self, result: FetchResult) {
        let fetched_at = Utc::now();

        match result {
            Ok(fetched) => {
                let parsed = SamplingConfig::parse(
                    fetched.header_pairs(),
                    &fetched.body,
                    &self.options.etag_header,
                    fetched_at,
                );

                match parsed {
                    Ok(config) => {
                        tandem_log::debug!(
                            etag = config.etag.as_deref(),
                            sample_rate = %config.sample_rate,
                            "received sampling config"
                        );
                        self.shared.snapshot.store(Arc::new(config));
                        metric!(
                            counter(TandemCounters::SamplingConfigFetch) += 1,
                            result = "success"
                        );
                    }
                    Err(error) => {
                        tandem_log::error!(
                            error = &error as &dyn std::error::Error,
                            "invalid sampling config, sampling everything"
                        );
                        self.shared
                            .snapshot
                            .store(Arc::new(SamplingConfig::fallback(fetched_at)));
                        metric!(
                            counter(TandemCounters::SamplingConfigFetch) += 1,
                            result = "invalid"
                        );
                    }
                }
            }
            Err(error) => {
                tandem_log::error!(
                    error = &error as &dyn std::error::Error,
                    "failed to fetch sampling config, keeping previous"
                );
                metric!(
                    counter(TandemCounters::SamplingConfigFetch) += 1,
                    result = error.metric_tag()
                );
            }
        }

        self.shared.release();
    }

    fn handle_shutdown(&mut self) {
        self.shutdown = true;
    }
}

impl Service for SamplingConfigService {
    type Interface = SamplingConfigManager;

    fn spawn_handler(mut self, mut rx: Receiver<Self::Interface>) {
        tokio::spawn(async move {
            tandem_log::info!("sampling config service starting");
            if self.shared.try_claim() {
                self.request_config();
            }

            loop {
                tokio::select! {
                    biased;

                    Some(result) = self.internal_rx.recv() => self.handle_result(result),
                    message = rx.recv() => match message {
                        Some(message) => self.handle_message(message),
                        None => break,
                    },
                    _ = self.shutdown_handle.notified() => self.handle_shutdown(),
                }
            }

            tandem_log::info!("sampling config service stopped");
        });
    }
}
