//! Orchestration of ingestion, correlation, sampling and delivery.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use tandem_statsd::metric;

use crate::batch::BatchAssembler;
use crate::cache::CorrelationCache;
use crate::message::MessageHalf;
use crate::statsd::{TandemCounters, TandemDistributions, TandemTimers};
use crate::upstream::{EventSink, SinkError};

/// An error ingesting a message half.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The sink rejected the batch.
    #[error("failed to deliver batch")]
    Sink(#[from] SinkError),
}

/// Whether the pipeline is currently draining completed pairs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    /// No ingestion is in progress.
    Idle,
    /// At least one ingestion is draining, sampling or delivering.
    Draining,
}

/// The result of a successful [`Pipeline::ingest`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Number of pairs completed by this ingestion.
    pub pairs: usize,
    /// Number of event records delivered to the sink.
    pub delivered: usize,
}

/// Decrements the active drain count when dropped.
struct DrainGuard<'a>(&'a AtomicUsize);

impl<'a> DrainGuard<'a> {
    fn enter(active: &'a AtomicUsize) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self(active)
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Joins message halves and delivers sampled transactions to a sink.
///
/// Every ingested half is inserted into the cache, followed by a drain of all completed pairs.
/// The pairs are sampled and delivered to the sink in a single call. Ingestion may run
/// concurrently, every pair is delivered by exactly one of the concurrent calls.
pub struct Pipeline {
    cache: Arc<CorrelationCache>,
    assembler: BatchAssembler,
    sink: Arc<dyn EventSink>,
    active_drains: AtomicUsize,
}

impl Pipeline {
    /// Creates a pipeline on top of a shared cache.
    pub fn new(
        cache: Arc<CorrelationCache>,
        assembler: BatchAssembler,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            cache,
            assembler,
            sink,
            active_drains: AtomicUsize::new(0),
        }
    }

    /// Returns the correlation cache of this pipeline.
    pub fn cache(&self) -> &Arc<CorrelationCache> {
        &self.cache
    }

    /// Returns whether an ingestion is currently draining.
    pub fn state(&self) -> PipelineState {
        match self.active_drains.load(Ordering::Acquire) {
            0 => PipelineState::Idle,
            _ => PipelineState::Draining,
        }
    }

    /// Ingests a single message half.
    ///
    /// Sink failures are logged and returned to the caller. The records of a failed batch are
    /// not retried.
    pub async fn ingest(&self, half: MessageHalf) -> Result<IngestOutcome, PipelineError> {
        let kind = half.kind();
        tandem_log::trace!(id = %half.id(), %kind, "ingesting half");

        self.cache.insert(half);
        metric!(counter(TandemCounters::HalvesIngested) += 1, kind = kind.as_str());

        let _guard = DrainGuard::enter(&self.active_drains);

        let pairs = self.cache.drain_completed();
        if pairs.is_empty() {
            return Ok(IngestOutcome::default());
        }

        let pair_count = pairs.len();
        metric!(counter(TandemCounters::PairsJoined) += pair_count as i64);

        let batch = self.assembler.assemble(pairs);
        let delivered = batch.len();
        if batch.is_empty() {
            return Ok(IngestOutcome {
                pairs: pair_count,
                delivered,
            });
        }

        metric!(distribution(TandemDistributions::BatchSize) = delivered as u64);

        let start = Instant::now();
        let result = self.sink.deliver(batch).await;
        let outcome = if result.is_ok() { "success" } else { "failure" };
        metric!(timer(TandemTimers::BatchDelivery) = start.elapsed(), result = outcome);

        if let Err(error) = result {
            tandem_log::error!(
                error = &error as &dyn std::error::Error,
                records = delivered,
                "failed to deliver batch"
            );
            return Err(error.into());
        }

        metric!(counter(TandemCounters::BatchDelivered) += delivered as i64);
        tandem_log::debug!(records = delivered, "delivered batch");

        Ok(IngestOutcome {
            pairs: pair_count,
            delivered,
        })
    }
}
