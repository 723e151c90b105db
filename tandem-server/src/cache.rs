//! The correlation cache joining request and response halves.

use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tandem_statsd::metric;
use tokio::time::Instant;

use crate::message::{
    CorrelationId, CorrelationPair, HalfKind, MessageHalf, RequestHalf, ResponseHalf,
};
use crate::statsd::TandemCounters;

/// A half waiting for its counterpart.
#[derive(Debug)]
struct Pending<T> {
    half: T,
    inserted: Instant,
}

impl<T> Pending<T> {
    fn new(half: T) -> Self {
        Self {
            half,
            inserted: Instant::now(),
        }
    }
}

type Store<T> = Mutex<HashMap<CorrelationId, Pending<T>>>;

/// The result of [`CorrelationCache::insert`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The half is now pending.
    Inserted,
    /// A pending half of the same kind and id was replaced.
    Replaced,
}

/// Number of pending halves per kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PendingCounts {
    /// Pending request halves.
    pub requests: usize,
    /// Pending response halves.
    pub responses: usize,
}

/// Number of halves removed by [`CorrelationCache::evict_expired`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EvictionStats {
    /// Evicted request halves.
    pub requests: usize,
    /// Evicted response halves.
    pub responses: usize,
}

impl EvictionStats {
    /// Total number of evicted halves.
    pub fn total(&self) -> usize {
        self.requests + self.responses
    }
}

/// Concurrent store of halves waiting for their counterpart.
///
/// Requests and responses are kept in two separate stores. Inserting only locks the store of the
/// inserted kind. Draining locks both stores, always the request store first, and removes every
/// complete pair within that single critical section. A half is therefore joined at most once,
/// and every pair with both halves present at the time of the drain is emitted.
#[derive(Debug, Default)]
pub struct CorrelationCache {
    requests: Store<RequestHalf>,
    responses: Store<ResponseHalf>,
}

impl CorrelationCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a half in the store of its kind.
    ///
    /// A half with the same id and kind as a pending half replaces it.
    pub fn insert(&self, half: MessageHalf) -> InsertOutcome {
        let kind = half.kind();
        let id = half.id().clone();

        let replaced = match half {
            MessageHalf::Request(request) => self
                .requests
                .lock()
                .insert(id.clone(), Pending::new(request))
                .is_some(),
            MessageHalf::Response(response) => self
                .responses
                .lock()
                .insert(id.clone(), Pending::new(response))
                .is_some(),
        };

        if !replaced {
            return InsertOutcome::Inserted;
        }

        tandem_log::warn!(%id, %kind, "replaced pending half with the same correlation id");
        metric!(counter(TandemCounters::HalvesReplaced) += 1, kind = kind.as_str());
        InsertOutcome::Replaced
    }

    /// Removes and returns all pairs whose halves are both present.
    pub fn drain_completed(&self) -> Vec<CorrelationPair> {
        let mut requests = self.requests.lock();
        let mut responses = self.responses.lock();

        if requests.is_empty() || responses.is_empty() {
            return Vec::new();
        }

        let matched: Vec<_> = requests
            .extract_if(|id, _| responses.contains_key(id))
            .collect();

        matched
            .into_iter()
            .filter_map(|(id, request)| {
                let response = responses.remove(&id)?;
                Some(CorrelationPair {
                    request: request.half,
                    response: response.half,
                })
            })
            .collect()
    }

    /// Removes all pending halves inserted longer than `max_age` ago.
    pub fn evict_expired(&self, max_age: Duration) -> EvictionStats {
        let mut requests = self.requests.lock();
        let mut responses = self.responses.lock();

        EvictionStats {
            requests: evict(&mut requests, max_age, HalfKind::Request),
            responses: evict(&mut responses, max_age, HalfKind::Response),
        }
    }

    /// Returns the number of pending halves per kind.
    pub fn pending(&self) -> PendingCounts {
        PendingCounts {
            requests: self.requests.lock().len(),
            responses: self.responses.lock().len(),
        }
    }

    /// Returns `true` if no half is pending.
    pub fn is_empty(&self) -> bool {
        self.pending() == PendingCounts::default()
    }
}

fn evict<T>(
    store: &mut HashMap<CorrelationId, Pending<T>>,
    max_age: Duration,
    kind: HalfKind,
) -> usize {
    let now = Instant::now();

    let evicted = store
        .extract_if(|_, pending| now.saturating_duration_since(pending.inserted) > max_age)
        .inspect(|(id, _)| tandem_log::debug!(%id, %kind, "evicting expired half"))
        .count();

    if evicted > 0 {
        metric!(
            counter(TandemCounters::HalvesEvicted) += evicted as i64,
            kind = kind.as_str()
        );
    }

    evicted
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::message::Body;

    fn request(id: &str) -> MessageHalf {
        MessageHalf::Request(RequestHalf {
            id: id.into(),
            timestamp: Utc::now(),
            method: "GET".to_owned(),
            uri: "https://api.example.com/".to_owned(),
            headers: Default::default(),
            body: Body::default(),
            user_id: None,
            company_id: None,
            metadata: Default::default(),
        })
    }

    fn response(id: &str) -> MessageHalf {
        MessageHalf::Response(ResponseHalf {
            id: id.into(),
            timestamp: Utc::now(),
            status_code: 200,
            headers: Default::default(),
            body: Body::default(),
        })
    }

    fn ids(pairs: &[CorrelationPair]) -> Vec<&str> {
        let mut ids: Vec<_> = pairs.iter().map(|pair| pair.id().as_str()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_join_in_any_order() {
        let cache = CorrelationCache::new();

        cache.insert(request("a"));
        cache.insert(response("b"));
        assert!(cache.drain_completed().is_empty());

        cache.insert(response("a"));
        cache.insert(request("b"));

        let pairs = cache.drain_completed();
        assert_eq!(ids(&pairs), ["a", "b"]);
        assert!(pairs.iter().all(|pair| pair.request.id == pair.response.id));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_drain_is_idempotent() {
        let cache = CorrelationCache::new();
        cache.insert(request("a"));

        assert!(cache.drain_completed().is_empty());
        assert!(cache.drain_completed().is_empty());
        assert_eq!(
            cache.pending(),
            PendingCounts {
                requests: 1,
                responses: 0
            }
        );
    }

    #[test]
    fn test_orphan_response_never_emitted() {
        let cache = CorrelationCache::new();
        cache.insert(response("orphan"));
        cache.insert(request("other"));

        assert!(cache.drain_completed().is_empty());
        assert_eq!(cache.pending().responses, 1);
    }

    #[test]
    fn test_replace_pending_half() {
        let cache = CorrelationCache::new();
        assert_eq!(cache.insert(request("a")), InsertOutcome::Inserted);
        assert_eq!(cache.insert(request("a")), InsertOutcome::Replaced);
        assert_eq!(cache.insert(response("a")), InsertOutcome::Inserted);

        assert_eq!(cache.drain_completed().len(), 1);
    }

    #[test]
    fn test_concurrent_drains_join_exactly_once() {
        let cache = Arc::new(CorrelationCache::new());
        let count = 2_000;

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    let mut joined = Vec::new();
                    for i in (worker..count).step_by(4) {
                        let id = i.to_string();
                        if i % 2 == 0 {
                            cache.insert(request(&id));
                            cache.insert(response(&id));
                        } else {
                            cache.insert(response(&id));
                            cache.insert(request(&id));
                        }
                        joined.extend(cache.drain_completed());
                    }
                    joined
                })
            })
            .collect();

        let mut ids: Vec<String> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .map(|pair| pair.id().to_string())
            .collect();

        ids.sort();
        let total = ids.len();
        ids.dedup();

        assert_eq!(total, count);
        assert_eq!(ids.len(), count);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired() {
        let cache = CorrelationCache::new();
        cache.insert(request("old"));
        cache.insert(response("older"));

        tokio::time::advance(Duration::from_secs(30)).await;
        cache.insert(request("new"));

        tokio::time::advance(Duration::from_secs(40)).await;
        let stats = cache.evict_expired(Duration::from_secs(60));

        assert_eq!(
            stats,
            EvictionStats {
                requests: 1,
                responses: 1
            }
        );
        assert_eq!(
            cache.pending(),
            PendingCounts {
                requests: 1,
                responses: 0
            }
        );
    }
}
