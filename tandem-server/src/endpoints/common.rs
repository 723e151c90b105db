//! Common facilities for ingest endpoints.

use std::error::Error;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::decode::DecodeError;
use crate::pipeline::PipelineError;

/// An error response body, listing the error and its causes.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ApiErrorResponse {
    #[serde(default)]
    detail: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    causes: Vec<String>,
}

impl ApiErrorResponse {
    /// Creates an error response from an error and its chain of sources.
    pub fn from_error<E: Error + ?Sized>(error: &E) -> Self {
        let mut causes = Vec::new();
        let mut source = error.source();

        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }

        Self {
            detail: Some(error.to_string()),
            causes,
        }
    }
}

/// An error rejecting a whole ingest request.
#[derive(Debug, thiserror::Error)]
pub enum BadIngestRequest {
    #[error("invalid ingest payload")]
    InvalidPayload(#[from] DecodeError),

    #[error("failed to process halves")]
    Pipeline(#[from] PipelineError),
}

impl IntoResponse for BadIngestRequest {
    fn into_response(self) -> Response {
        let status = match self {
            BadIngestRequest::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            BadIngestRequest::Pipeline(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, axum::Json(ApiErrorResponse::from_error(&self))).into_response()
    }
}
