//! StatsD metrics for Tandem, sent through [cadence].
//!
//! Every metric is declared as an enum implementing one of [`CounterMetric`], [`GaugeMetric`],
//! [`DistributionMetric`] or [`TimerMetric`]. The trait only provides the metric name, but it
//! binds the name to a kind, so a counter cannot be reported as a gauge by accident.
//!
//! Metrics are recorded with the [`metric!`] macro. Until [`init`] is called, or if no statsd
//! address is configured, the macro does nothing.
//!
//! ```no_run
//! # use std::collections::BTreeMap;
//! use tandem_statsd::{CounterMetric, MetricsClientConfig, metric};
//!
//! enum ServerCounters {
//!     Requests,
//! }
//!
//! impl CounterMetric for ServerCounters {
//!     fn name(&self) -> &'static str {
//!         match self {
//!             Self::Requests => "requests",
//!         }
//!     }
//! }
//!
//! tandem_statsd::init(MetricsClientConfig {
//!     prefix: "tandem",
//!     host: "localhost:8125",
//!     default_tags: BTreeMap::new(),
//!     default_sample_rate: 1.0.into(),
//! })
//! .ok();
//!
//! metric!(counter(ServerCounters::Requests) += 1, route = "halves");
//! ```
//!
//! [cadence]: https://docs.rs/cadence

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use cadence::{BufferedUdpMetricSink, Metric, MetricBuilder, QueuingMetricSink, StatsdClient};
use parking_lot::RwLock;

/// Fraction of metrics that are sent, clamped to `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleRate(f64);

impl From<f64> for SampleRate {
    fn from(value: f64) -> Self {
        Self(value.clamp(0.0, 1.0))
    }
}

impl From<SampleRate> for f64 {
    fn from(value: SampleRate) -> Self {
        value.0
    }
}

/// The statsd client together with the tags and sample rate applied to every metric.
#[derive(Debug)]
pub struct MetricsClient {
    /// The raw statsd client.
    pub statsd_client: StatsdClient,
    /// Tags added to every metric.
    pub default_tags: BTreeMap<String, String>,
    /// Fraction of metrics that are sent.
    pub default_sample_rate: SampleRate,
}

/// Options for [`init`].
#[derive(Debug)]
pub struct MetricsClientConfig<'a, A> {
    /// Prefix prepended to all metric names.
    pub prefix: &'a str,
    /// Address of the statsd server.
    pub host: A,
    /// Tags added to every metric.
    pub default_tags: BTreeMap<String, String>,
    /// Fraction of metrics that are sent.
    pub default_sample_rate: SampleRate,
}

impl MetricsClient {
    /// Sends a metric after applying the default tags and the sample rate.
    #[inline(always)]
    pub fn send_metric<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        let SampleRate(rate) = self.default_sample_rate;
        if rate <= 0.0 || (rate < 1.0 && !rand::random_bool(rate)) {
            return;
        }

        for (key, value) in &self.default_tags {
            metric = metric.with_tag(key, value);
        }

        if rate < 1.0 {
            metric = metric.with_sampling_rate(rate);
        }

        if let Err(error) = metric.try_send() {
            tandem_log::error!(
                error = &error as &dyn std::error::Error,
                "failed to send metric"
            );
        }
    }
}

static GLOBAL_CLIENT: RwLock<Option<Arc<MetricsClient>>> = RwLock::new(None);

thread_local! {
    /// Per-thread copy of the global client, so that sending does not take the lock.
    static THREAD_CLIENT: RefCell<Option<Arc<MetricsClient>>> =
        RefCell::new(GLOBAL_CLIENT.read().clone());
}

#[doc(hidden)]
pub mod _pred {
    pub use cadence::prelude::*;
}

/// Converts a duration into the fractional milliseconds reported for timers.
#[doc(hidden)]
pub fn _millis(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1e6
}

/// Installs the client for all threads.
///
/// Threads that already recorded a metric keep their previous client, except for the calling
/// thread. Call this before spawning any runtime.
pub fn set_client(client: MetricsClient) {
    let client = Arc::new(client);
    *GLOBAL_CLIENT.write() = Some(Arc::clone(&client));
    THREAD_CLIENT.with(|cell| cell.replace(Some(client)));
}

/// Runs `f` with a client that records all metrics of the current thread and returns them.
pub fn with_capturing_test_client(f: impl FnOnce()) -> Vec<String> {
    let (rx, sink) = cadence::SpyMetricSink::new();
    let client = MetricsClient {
        statsd_client: StatsdClient::from_sink("", sink),
        default_tags: BTreeMap::new(),
        default_sample_rate: 1.0.into(),
    };

    let previous = THREAD_CLIENT.with(|cell| cell.replace(Some(Arc::new(client))));
    f();
    THREAD_CLIENT.with(|cell| cell.replace(previous));

    rx.try_iter()
        .map(|metric| String::from_utf8_lossy(&metric).into_owned())
        .collect()
}

/// Starts reporting metrics to the statsd server at `config.host`.
///
/// Metrics are buffered into UDP datagrams and flushed from a background thread, so recording
/// a metric never blocks on the network.
pub fn init<A: ToSocketAddrs>(config: MetricsClientConfig<'_, A>) -> io::Result<()> {
    let addr = config
        .host
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no statsd address resolved"))?;

    tandem_log::info!("reporting metrics to statsd at {addr}");
    if f64::from(config.default_sample_rate) == 0.0 {
        tandem_log::debug!("metrics sample rate is 0, no metrics will be reported");
    }

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let udp = BufferedUdpMetricSink::from(addr, socket).map_err(io::Error::other)?;
    let sink = QueuingMetricSink::from(udp);

    set_client(MetricsClient {
        statsd_client: StatsdClient::from_sink(config.prefix, sink),
        default_tags: config.default_tags,
        default_sample_rate: config.default_sample_rate,
    });

    Ok(())
}

/// Invokes `f` with the client of the current thread.
///
/// Returns the default value of `R` if no client is installed. Prefer the [`metric!`] macro.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    THREAD_CLIENT.with(|cell| match cell.borrow().as_deref() {
        Some(client) => f(client),
        None => R::default(),
    })
}

/// A duration, reported in milliseconds.
///
/// ```
/// use std::time::Instant;
/// use tandem_statsd::{TimerMetric, metric};
///
/// struct FetchDuration;
///
/// impl TimerMetric for FetchDuration {
///     fn name(&self) -> &'static str {
///         "fetch_duration"
///     }
/// }
///
/// let start = Instant::now();
/// metric!(timer(FetchDuration) = start.elapsed(), result = "ok");
///
/// // Times the enclosed block and returns its value.
/// let value = metric!(timer(FetchDuration), result = "ok", { 42 });
/// assert_eq!(value, 42);
/// ```
pub trait TimerMetric {
    /// Returns the metric name.
    fn name(&self) -> &'static str;
}

/// A count of events, aggregated by the statsd server.
pub trait CounterMetric {
    /// Returns the metric name.
    fn name(&self) -> &'static str;
}

/// A sampled value, such as a batch size.
pub trait DistributionMetric {
    /// Returns the metric name.
    fn name(&self) -> &'static str;
}

/// The current value of a quantity, such as the number of pending items.
pub trait GaugeMetric {
    /// Returns the metric name.
    fn name(&self) -> &'static str;
}

/// Records a metric with optional tags.
///
/// ```ignore
/// metric!(counter(Counters::Requests) += 1, route = "halves");
/// metric!(gauge(Gauges::Pending) = 12);
/// metric!(distribution(Distributions::BatchSize) = 100, sink = "http");
/// metric!(timer(Timers::Fetch) = start.elapsed());
/// let value = metric!(timer(Timers::Fetch), { fetch() });
/// ```
///
/// Counter increments of zero are not sent.
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {{
        let value: i64 = $value;
        if value != 0 {
            $crate::metric!(
                @send count_with_tags, $crate::CounterMetric::name(&$id), value
                $(, $($k).* = $v)*
            );
        }
    }};

    (gauge($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::metric!(
            @send gauge_with_tags, $crate::GaugeMetric::name(&$id), $value
            $(, $($k).* = $v)*
        )
    };

    (distribution($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::metric!(
            @send distribution_with_tags, $crate::DistributionMetric::name(&$id), $value
            $(, $($k).* = $v)*
        )
    };

    (timer($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::metric!(
            @send distribution_with_tags, $crate::TimerMetric::name(&$id), $crate::_millis($value)
            $(, $($k).* = $v)*
        )
    };

    (timer($id:expr), $($($k:ident).* = $v:expr,)* $block:block) => {{
        let start = std::time::Instant::now();
        let value = $block;
        $crate::metric!(timer($id) = start.elapsed() $(, $($k).* = $v)*);
        value
    }};

    (@send $method:ident, $name:expr, $value:expr $(, $($k:ident).* = $v:expr)*) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.statsd_client.$method($name, $value)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };
}
