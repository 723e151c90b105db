use tandem_statsd::{CounterMetric, DistributionMetric, GaugeMetric, TimerMetric};

/// Gauge metrics used by Tandem.
pub enum TandemGauges {
    /// The number of halves waiting in the correlation cache for their counterpart.
    ///
    /// This metric is tagged with:
    /// - `kind`: `request` or `response`.
    CachePending,
}

impl GaugeMetric for TandemGauges {
    fn name(&self) -> &'static str {
        match self {
            TandemGauges::CachePending => "cache.pending",
        }
    }
}

/// Histogram metrics used by Tandem.
pub enum TandemDistributions {
    /// The number of event records in a batch handed to the sink.
    BatchSize,
}

impl DistributionMetric for TandemDistributions {
    fn name(&self) -> &'static str {
        match self {
            TandemDistributions::BatchSize => "batch.size",
        }
    }
}

/// Timer metrics used by Tandem.
pub enum TandemTimers {
    /// Time spent delivering a single batch to the sink.
    ///
    /// This metric is tagged with:
    /// - `result`: `success` or `failure`.
    BatchDelivery,
    /// Time spent fetching the sampling configuration, including timeouts.
    SamplingConfigFetch,
}

impl TimerMetric for TandemTimers {
    fn name(&self) -> &'static str {
        match self {
            TandemTimers::BatchDelivery => "batch.delivery",
            TandemTimers::SamplingConfigFetch => "sampling_config.fetch_duration",
        }
    }
}

/// Counter metrics used by Tandem.
pub enum TandemCounters {
    /// Number of message halves inserted into the correlation cache.
    ///
    /// This metric is tagged with:
    /// - `kind`: `request` or `response`.
    HalvesIngested,
    /// Number of envelopes that could not be decoded into a message half.
    HalvesInvalid,
    /// Number of pending halves removed from the cache after exceeding their maximum age.
    ///
    /// This metric is tagged with:
    /// - `kind`: `request` or `response`.
    HalvesEvicted,
    /// Number of halves that replaced a pending half of the same kind and correlation id.
    ///
    /// This metric is tagged with:
    /// - `kind`: `request` or `response`.
    HalvesReplaced,
    /// Number of request and response halves joined into a pair.
    PairsJoined,
    /// Number of sampling decisions.
    ///
    /// This metric is tagged with:
    /// - `decision`: `keep` or `drop`.
    EventsSampled,
    /// Number of joined pairs that could not be turned into an event record.
    EventsInvalid,
    /// Number of event records delivered to the sink.
    BatchDelivered,
    /// Number of sampling configuration fetches.
    ///
    /// This metric is tagged with:
    /// - `result`: `success`, `invalid`, `unauthorized`, `failure` or `timeout`.
    SamplingConfigFetch,
}

impl CounterMetric for TandemCounters {
    fn name(&self) -> &'static str {
        match self {
            TandemCounters::HalvesIngested => "halves.ingested",
            TandemCounters::HalvesInvalid => "halves.invalid",
            TandemCounters::HalvesEvicted => "halves.evicted",
            TandemCounters::HalvesReplaced => "halves.replaced",
            TandemCounters::PairsJoined => "pairs.joined",
            TandemCounters::EventsSampled => "events.sampled",
            TandemCounters::EventsInvalid => "events.invalid",
            TandemCounters::BatchDelivered => "batch.delivered",
            TandemCounters::SamplingConfigFetch => "sampling_config.fetch",
        }
    }
}
