//! Periodic eviction of expired halves.

use std::sync::Arc;
use std::time::Duration;

use tandem_statsd::metric;
use tandem_system::{Receiver, Service, ShutdownHandle};
use tokio::time::MissedTickBehavior;

use crate::cache::CorrelationCache;
use crate::statsd::TandemGauges;

/// Service evicting halves that never found their counterpart.
///
/// Every `interval`, halves older than `max_age` are removed from the cache and the number of
/// pending halves is reported. The service has no messages and stops on shutdown.
#[derive(Debug)]
pub struct CacheReaperService {
    cache: Arc<CorrelationCache>,
    max_age: Duration,
    interval: Duration,
    shutdown_handle: ShutdownHandle,
}

impl CacheReaperService {
    /// Creates a new [`CacheReaperService`].
    pub fn new(
        cache: Arc<CorrelationCache>,
        max_age: Duration,
        interval: Duration,
        shutdown_handle: ShutdownHandle,
    ) -> Self {
        Self {
            cache,
            max_age,
            interval,
            shutdown_handle,
        }
    }

    fn reap(&self) {
        let stats = self.cache.evict_expired(self.max_age);
        if stats.total() > 0 {
            tandem_log::debug!(
                requests = stats.requests,
                responses = stats.responses,
                "evicted expired halves"
            );
        }

        let pending = self.cache.pending();
        metric!(gauge(TandemGauges::CachePending) = pending.requests as u64, kind = "request");
        metric!(gauge(TandemGauges::CachePending) = pending.responses as u64, kind = "response");
    }
}

impl Service for CacheReaperService {
    type Interface = ();

    fn spawn_handler(mut self, _rx: Receiver<Self::Interface>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            tandem_log::info!("cache reaper starting");
            loop {
                tokio::select! {
                    biased;

                    _ = self.shutdown_handle.notified() => break,
                    _ = ticker.tick() => self.reap(),
                }
            }
            tandem_log::info!("cache reaper stopped");
        });
    }
}
