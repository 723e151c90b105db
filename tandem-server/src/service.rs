use std::fmt;
use std::sync::Arc;

use tandem_config::Config;
use tandem_system::{Controller, Service};
use tokio::runtime::Runtime;

use crate::batch::{BatchAssembler, EventOptions};
use crate::cache::CorrelationCache;
use crate::pipeline::Pipeline;
use crate::services::cache_reaper::CacheReaperService;
use crate::services::sampling_config::{SamplingConfigOptions, SamplingConfigService};
use crate::services::server::ServerError;
use crate::upstream::{self, UpstreamConfigSource, UpstreamSink};

/// Constructs a tokio [`Runtime`] configured for running [services](tandem_system::Service).
pub fn create_runtime(name: &str, threads: usize) -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .thread_name(name)
        .worker_threads(threads)
        .enable_all()
        .build()
        .unwrap()
}

/// Server state shared by all endpoints.
#[derive(Clone)]
pub struct ServiceState {
    config: Arc<Config>,
    pipeline: Arc<Pipeline>,
}

impl ServiceState {
    /// Starts all services and returns the state for the endpoints.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(config: Arc<Config>, controller: &Controller) -> Result<Self, ServerError> {
        let client = upstream::create_client(&config).map_err(ServerError::HttpClient)?;
        let source = UpstreamConfigSource::new(client.clone(), &config)?;
        let sink = UpstreamSink::new(client, &config)?;

        let sampling = SamplingConfigService::new(
            Arc::new(source),
            SamplingConfigOptions::from_config(&config),
            controller.shutdown_handle(),
        )
        .start_handle();

        let cache = Arc::new(CorrelationCache::new());
        match config.cache_max_age() {
            Some(max_age) => {
                CacheReaperService::new(
                    cache.clone(),
                    max_age,
                    config.cache_eviction_interval(),
                    controller.shutdown_handle(),
                )
                .start();
            }
            None => tandem_log::info!("cache eviction disabled"),
        }

        let assembler = BatchAssembler::new(sampling, EventOptions::from_config(&config));
        let pipeline = Pipeline::new(cache, assembler, Arc::new(sink));

        Ok(Self::new(config, Arc::new(pipeline)))
    }

    /// Creates the state from a running pipeline.
    pub fn new(config: Arc<Config>, pipeline: Arc<Pipeline>) -> Self {
        Self { config, pipeline }
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the pipeline ingesting message halves.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}

impl fmt::Debug for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceState")
            .field("config", &self.config.path())
            .field("pipeline", &self.pipeline.state())
            .finish()
    }
}
