//! Web server endpoints.
//!
//! Halves are ingested through `/api/0/halves`. The health check lives at `/api/health`.

use axum::Router;
use axum::routing::get;
use tandem_config::Config;

use crate::service::ServiceState;

mod common;
mod halves;
mod health_check;

/// Builds the router with all endpoints.
pub fn routes(config: &Config) -> Router<ServiceState> {
    Router::new()
        .route("/api/health", get(health_check::handle))
        .route("/api/0/halves", halves::route(config))
}
