use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// A sample rate as a percentage in `[0, 100]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct SampleRate(u32);

impl SampleRate {
    /// Keeps every transaction.
    pub const ALL: Self = Self(100);

    /// Creates a sample rate, clamping values above 100 to 100.
    pub fn new(percent: u32) -> Self {
        if percent > 100 {
            Self::ALL
        } else {
            Self(percent)
        }
    }

    /// Returns the rate as a percentage.
    pub fn percent(self) -> u32 {
        self.0
    }

    /// Returns the reconstruction weight of a transaction kept at this rate.
    ///
    /// A rate of 0 has a weight of 1.
    pub fn weight(self) -> u32 {
        match self.0 {
            0 => 1,
            rate => 100 / rate,
        }
    }

    /// Parses a rate from a JSON integer or a string holding an integer.
    ///
    /// Out of range values are clamped to 100. Returns `None` for any other value.
    fn from_json(value: &Value) -> Option<Self> {
        let percent = match value {
            Value::Number(number) => number.as_i64()?,
            Value::String(string) => string.trim().parse().ok()?,
            _ => return None,
        };

        Some(match u32::try_from(percent) {
            Ok(percent) => Self::new(percent),
            Err(_) => Self::ALL,
        })
    }
}

impl Default for SampleRate {
    fn default() -> Self {
        Self::ALL
    }
}

impl fmt::Display for SampleRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// An error parsing a sampling configuration payload.
#[derive(Debug, thiserror::Error)]
pub enum SamplingConfigError {
    /// The payload is not valid JSON.
    #[error("sampling config is not valid json")]
    InvalidJson(#[from] serde_json::Error),
    /// The payload is valid JSON, but not an object.
    #[error("sampling config is not a json object")]
    NotAnObject,
}

/// An immutable snapshot of the sampling configuration.
///
/// Snapshots are never mutated. A refresh builds a new snapshot and replaces the previous one
/// wholesale.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SamplingConfig {
    /// Version tag of the configuration, taken from a response header.
    pub etag: Option<String>,
    /// The rate applied when no override matches.
    pub sample_rate: SampleRate,
    /// Rate overrides by user id.
    pub user_sample_rate: BTreeMap<String, SampleRate>,
    /// Rate overrides by company id.
    pub company_sample_rate: BTreeMap<String, SampleRate>,
    /// The time this snapshot was fetched.
    pub fetched_at: DateTime<Utc>,
}

impl SamplingConfig {
    /// A configuration that keeps every transaction.
    ///
    /// This is in effect at startup, before the first configuration was fetched.
    pub fn sample_all(fetched_at: DateTime<Utc>) -> Self {
        Self {
            etag: None,
            sample_rate: SampleRate::ALL,
            user_sample_rate: BTreeMap::new(),
            company_sample_rate: BTreeMap::new(),
            fetched_at,
        }
    }

    /// The configuration published when the collector returns an unusable payload.
    pub fn fallback(fetched_at: DateTime<Utc>) -> Self {
        Self::sample_all(fetched_at)
    }

    /// Parses a configuration from the response of the collector.
    ///
    /// The version tag is read from the header named `etag_header`, matched case-insensitively.
    /// A missing or unparsable `sample_rate` defaults to 100. Override entries that are not valid
    /// rates are skipped.
    pub fn parse<'a, I>(
        headers: I,
        body: &[u8],
        etag_header: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<Self, SamplingConfigError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let etag = headers
            .into_iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(etag_header))
            .map(|(_, value)| value.to_owned());

        let Value::Object(object) = serde_json::from_slice(body)? else {
            return Err(SamplingConfigError::NotAnObject);
        };

        let sample_rate = match object.get("sample_rate") {
            None | Some(Value::Null) => SampleRate::ALL,
            Some(value) => SampleRate::from_json(value).unwrap_or_else(|| {
                tandem_log::warn!(value = %value, "invalid default sample rate, sampling everything");
                SampleRate::ALL
            }),
        };

        Ok(Self {
            etag,
            sample_rate,
            user_sample_rate: parse_overrides(&object, "user_sample_rate"),
            company_sample_rate: parse_overrides(&object, "company_sample_rate"),
            fetched_at,
        })
    }

    /// Returns the override for the given user id, if any.
    pub fn user_rate(&self, user_id: &str) -> Option<SampleRate> {
        self.user_sample_rate.get(user_id).copied()
    }

    /// Returns the override for the given company id, if any.
    pub fn company_rate(&self, company_id: &str) -> Option<SampleRate> {
        self.company_sample_rate.get(company_id).copied()
    }
}

fn parse_overrides(object: &Map<String, Value>, key: &str) -> BTreeMap<String, SampleRate> {
    let entries = match object.get(key) {
        None | Some(Value::Null) => return BTreeMap::new(),
        Some(Value::Object(entries)) => entries,
        Some(_) => {
            tandem_log::warn!(key, "sample rate overrides are not an object, ignoring");
            return BTreeMap::new();
        }
    };

    entries
        .iter()
        .filter_map(|(id, value)| match SampleRate::from_json(value) {
            Some(rate) => Some((id.clone(), rate)),
            None => {
                tandem_log::warn!(key, id = %id, value = %value, "skipping invalid sample rate override");
                None
            }
        })
        .collect()
}
