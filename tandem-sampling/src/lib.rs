//! Adaptive sampling for completed transactions.
//!
//! The collector publishes a sampling configuration with a default sample rate and optional
//! per-user and per-company overrides. This crate parses that payload into an immutable
//! [`SamplingConfig`] snapshot and makes [sampling decisions](SamplingDecision) against it.
//!
//! # Sample rates
//!
//! Rates are percentages in `[0, 100]`. The effective rate of a transaction is resolved in this
//! order:
//!
//!  1. The user override, if the transaction has a user id with an override.
//!  2. The company override, if the transaction has a company id with an override.
//!  3. The default rate of the configuration.
//!  4. `100` if no configuration is available at all.
//!
//! Kept transactions carry a weight of `100 / rate` so that downstream consumers can reconstruct
//! the true volume.
//!
//! # Example payload
//!
//! ```json
//! {
//!   "sample_rate": 50,
//!   "user_sample_rate": { "u1": 100 },
//!   "company_sample_rate": { "c1": "10" }
//! }
//! ```
#![warn(missing_docs)]

mod config;
mod evaluation;

pub use self::config::*;
pub use self::evaluation::*;
