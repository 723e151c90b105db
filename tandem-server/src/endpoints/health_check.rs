//! A simple health check endpoint.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;

#[derive(Serialize)]
struct Status {
    is_healthy: bool,
}

pub async fn handle() -> impl IntoResponse {
    (StatusCode::OK, axum::Json(Status { is_healthy: true }))
}
