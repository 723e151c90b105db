//! Configuration for the Tandem CLI and server.
//!
//! The configuration is loaded from `config.yml` in a config folder. Every section and field has
//! a default, so a missing file or a partial file is valid. Values can be overridden from the
//! command line or the environment with [`OverridableConfig`].
#![warn(missing_docs)]

mod byte_size;
mod config;

pub use self::byte_size::*;
pub use self::config::*;
