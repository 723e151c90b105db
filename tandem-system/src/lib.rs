//! Foundational system components for Tandem's services.
//!
//! A [`Service`] owns its state and handles messages of its [`Interface`] one at a time from an
//! inbox. Other components hold an [`Addr`] to send messages into that inbox. The [`Controller`]
//! broadcasts shutdown to all services that hold a [`ShutdownHandle`].
#![warn(missing_docs)]

mod controller;
mod service;

pub use self::controller::*;
pub use self::service::*;
