//! Long running services of the server.
//!
//! Services are started through [`tandem_system::Service::start`] and stop when the
//! [`Controller`](tandem_system::Controller) shuts down.

pub mod cache_reaper;
pub mod sampling_config;
pub mod server;
