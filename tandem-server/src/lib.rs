//! The Tandem correlation server.
//!
//! This crate contains the [`run`] function which starts the server. The server accepts halves of
//! HTTP transactions captured by a gateway, joins requests with their responses, samples the
//! joined transactions and delivers them in batches to the collector.
//!
//! # Data Flow
//!
//! ```text
//!  POST /api/0/halves
//!          |
//!          v
//!   decode envelopes --(invalid)--> dropped
//!          |
//!          v
//!   CorrelationCache ----------------- CacheReaperService (evicts orphans)
//!          |
//!   drain completed pairs
//!          |
//!          v
//!   BatchAssembler <------------------ SamplingConfigService (refreshes from upstream)
//!          |
//!          v
//!      EventSink ---> collector
//! ```
//!
//! Each ingested half is inserted into the [`CorrelationCache`](cache::CorrelationCache). The
//! [`Pipeline`](pipeline::Pipeline) then drains every pair that has both halves, converts the
//! pairs into event records, applies the current sampling configuration and hands the kept
//! records to the sink in a single batch.
//!
//! # Services
//!
//! Background work runs in services started by [`ServiceState::start`]:
//!
//!  - [`SamplingConfigService`](services::sampling_config::SamplingConfigService) keeps the
//!    current sampling configuration and refetches it when the pipeline observes that it is
//!    stale. At most one fetch is in flight.
//!  - [`CacheReaperService`](services::cache_reaper::CacheReaperService) removes halves that
//!    never received their counterpart within the configured maximum age.
//!
//! All services stop when the [`Controller`] signals a shutdown.
#![warn(missing_docs)]

pub mod batch;
pub mod cache;
pub mod decode;
pub mod message;
pub mod pipeline;
pub mod services;
pub mod upstream;

mod endpoints;
mod service;
mod statsd;

use std::sync::Arc;

use tandem_config::Config;
use tandem_system::{Controller, ShutdownMode};

pub use self::service::{ServiceState, create_runtime};
pub use self::services::server::{HttpServer, ServerError};

/// Runs the server until the process receives a termination signal.
///
/// This starts all services, binds the HTTP listener and blocks the current thread. On a
/// graceful shutdown, open requests are given the configured shutdown timeout to finish.
pub fn run(config: Config) -> Result<(), ServerError> {
    let runtime = create_runtime("tandem-server", num_workers());
    let controller = Controller::new(config.shutdown_timeout());

    runtime.block_on(serve_until_signal(Arc::new(config), controller))?;
    tandem_log::info!("tandem shutdown complete");
    Ok(())
}

async fn serve_until_signal(
    config: Arc<Config>,
    controller: Controller,
) -> Result<(), ServerError> {
    let state = ServiceState::start(config.clone(), &controller)?;
    let server = HttpServer::new(&config, state)?;
    let server = tokio::spawn(server.serve(controller.shutdown_handle()));

    if controller.run_until_signal().await == ShutdownMode::Immediate {
        return Ok(());
    }

    match tokio::time::timeout(controller.shutdown_timeout(), server).await {
        Ok(Ok(Ok(()))) => (),
        Ok(Ok(Err(error))) => tandem_log::error!(
            error = &error as &dyn std::error::Error,
            "http server failed"
        ),
        Ok(Err(error)) => tandem_log::error!(
            error = &error as &dyn std::error::Error,
            "http server panicked"
        ),
        Err(_) => tandem_log::warn!("shutdown timeout elapsed, dropping open requests"),
    }

    Ok(())
}

fn num_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
