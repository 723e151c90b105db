//! Sampling decisions for completed transactions.

use rand::Rng;

use crate::config::{SampleRate, SamplingConfig};

/// Resolves the sample rate that applies to a transaction.
///
/// Empty ids never match an override. Without a configuration, everything is sampled.
pub fn effective_sample_rate(
    config: Option<&SamplingConfig>,
    user_id: Option<&str>,
    company_id: Option<&str>,
) -> SampleRate {
    let Some(config) = config else {
        return SampleRate::ALL;
    };

    let user_rate = user_id
        .filter(|id| !id.is_empty())
        .and_then(|id| config.user_rate(id));

    let company_rate = || {
        company_id
            .filter(|id| !id.is_empty())
            .and_then(|id| config.company_rate(id))
    };

    user_rate
        .or_else(company_rate)
        .unwrap_or(config.sample_rate)
}

/// The outcome of sampling a single transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SamplingDecision {
    /// Whether the transaction is kept.
    pub keep: bool,
    /// The effective sample rate in percent.
    pub sample_rate: u32,
    /// The reconstruction weight of a kept transaction.
    pub weight: u32,
}

impl SamplingDecision {
    /// Makes a random sampling decision.
    pub fn evaluate(
        config: Option<&SamplingConfig>,
        user_id: Option<&str>,
        company_id: Option<&str>,
    ) -> Self {
        let roll = rand::rng().random_range(0.0..100.0);
        Self::with_roll(config, user_id, company_id, roll)
    }

    /// Makes a sampling decision for a given roll in `[0, 100)`.
    ///
    /// The transaction is kept if the roll does not exceed the effective rate. A rate of 100
    /// always keeps, and a rate of 0 keeps only on a roll of exactly zero.
    pub fn with_roll(
        config: Option<&SamplingConfig>,
        user_id: Option<&str>,
        company_id: Option<&str>,
        roll: f64,
    ) -> Self {
        let rate = effective_sample_rate(config, user_id, company_id);

        Self {
            keep: f64::from(rate.percent()) >= roll,
            sample_rate: rate.percent(),
            weight: rate.weight(),
        }
    }

    /// Returns `true` if the transaction is dropped.
    pub fn should_drop(&self) -> bool {
        !self.keep
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;

    fn config(default: u32, users: &[(&str, u32)], companies: &[(&str, u32)]) -> SamplingConfig {
        let to_map = |entries: &[(&str, u32)]| -> BTreeMap<String, SampleRate> {
            entries
                .iter()
                .map(|(id, rate)| ((*id).to_owned(), SampleRate::new(*rate)))
                .collect()
        };

        SamplingConfig {
            etag: None,
            sample_rate: SampleRate::new(default),
            user_sample_rate: to_map(users),
            company_sample_rate: to_map(companies),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn test_precedence() {
        let config = config(100, &[("u1", 50)], &[("c1", 10)]);

        let rate = |user, company| effective_sample_rate(Some(&config), user, company).percent();

        assert_eq!(rate(Some("u1"), Some("c1")), 50);
        assert_eq!(rate(Some("u2"), Some("c1")), 10);
        assert_eq!(rate(None, Some("c1")), 10);
        assert_eq!(rate(Some("u2"), Some("c2")), 100);
        assert_eq!(rate(None, None), 100);
    }

    #[test]
    fn test_empty_ids_never_match() {
        let config = config(70, &[("", 5)], &[("", 5)]);
        let rate = effective_sample_rate(Some(&config), Some(""), Some(""));
        assert_eq!(rate.percent(), 70);
    }

    #[test]
    fn test_no_config_samples_all() {
        let decision = SamplingDecision::with_roll(None, Some("u1"), None, 99.999);
        assert_eq!(
            decision,
            SamplingDecision {
                keep: true,
                sample_rate: 100,
                weight: 1,
            }
        );
    }

    #[test]
    fn test_rate_zero_almost_never_keeps() {
        let config = config(0, &[], &[]);

        // Only the lowest possible roll passes a rate of zero.
        let edge = SamplingDecision::with_roll(Some(&config), None, None, 0.0);
        assert!(edge.keep);
        assert_eq!(edge.weight, 1);

        for roll in [0.1, 0.5, 50.0, 99.9] {
            let decision = SamplingDecision::with_roll(Some(&config), None, None, roll);
            assert!(decision.should_drop());
            assert_eq!(decision.weight, 1);
        }

        for _ in 0..1000 {
            assert!(!SamplingDecision::evaluate(Some(&config), None, None).keep);
        }
    }

    #[test]
    fn test_rate_hundred_always_keeps() {
        let config = config(100, &[], &[]);
        for _ in 0..1000 {
            let decision = SamplingDecision::evaluate(Some(&config), None, None);
            assert!(decision.keep);
            assert_eq!(decision.weight, 1);
        }
    }

    #[test]
    fn test_roll_threshold() {
        let config = config(25, &[], &[]);

        let kept = SamplingDecision::with_roll(Some(&config), None, None, 24.9);
        assert!(kept.keep);
        assert_eq!(kept.weight, 4);

        let boundary = SamplingDecision::with_roll(Some(&config), None, None, 25.0);
        assert!(boundary.keep);

        let dropped = SamplingDecision::with_roll(Some(&config), None, None, 25.5);
        assert!(!dropped.keep);
    }

    #[test]
    fn test_user_override_keeps_user() {
        // A user at 100 is always kept, regardless of a restrictive default.
        let config = config(0, &[("u1", 100)], &[]);
        let decision = SamplingDecision::with_roll(Some(&config), Some("u1"), None, 99.0);
        assert!(decision.keep);
        assert_eq!(decision.weight, 1);
    }
}
