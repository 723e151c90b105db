//! Logging for Tandem, built on `tracing`.
//!
//! The binary calls [`init`] once at startup with the [`LogConfig`] from the config file. Library
//! crates only use the re-exported macros [`error!`], [`warn!`], [`info!`], [`debug!`] and
//! [`trace!`].
//!
//! Messages start lowercase and have no trailing punctuation. Values go into structured fields
//! rather than the message. Errors are attached as an `error` field, so that the subscriber
//! records their sources:
//!
//! ```
//! let error = std::io::Error::other("connection reset");
//! tandem_log::error!(
//!     error = &error as &dyn std::error::Error,
//!     records = 12,
//!     "failed to deliver batch"
//! );
//! ```
//!
//! Where a plain string is needed, [`LogError`] prints an error followed by its causes.
//!
//! Tests call [`init_test!`] to print the logs of the calling crate at `TRACE` level:
//!
//! ```ignore
//! #[test]
//! fn test_something() {
//!     tandem_log::init_test!();
//! }
//! ```

#![warn(missing_docs)]

#[cfg(feature = "init")]
mod setup;
#[cfg(feature = "init")]
pub use setup::*;

#[cfg(feature = "test")]
mod test;
#[cfg(feature = "test")]
pub use test::*;

mod utils;
pub use utils::*;

// Expose the minimal log facade.
#[doc(inline)]
pub use tracing::{debug, error, info, trace, warn};
