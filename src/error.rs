//! Unified HTTP error type for axum request handlers (`spec.md` §7).
//!
//! Grounded on `AppError` (wrap-and-convert-via-`IntoResponse`), but
//! unlike that source, which always answers `500`, [`GatewayError`] distinguishes
//! malformed requests (400), upstream timeouts (504), and upstream connection
//! failures (503) from genuinely unexpected internal errors (500), matching the
//! status-code table in `spec.md` §7.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    BadRequest(String),
    #[error("request timed out")]
    Timeout,
    #[error("upstream connection error: {0}")]
    Connection(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self, "request failed");

        let (status, label, message) = match &self {
            GatewayError::BadRequest(m) => (StatusCode::BAD_REQUEST, "Invalid request", m.clone()),
            GatewayError::Timeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "Request timeout",
                "The model took too long to respond".to_string(),
            ),
            GatewayError::Connection(m) => (StatusCode::SERVICE_UNAVAILABLE, "Service unavailable", m.clone()),
            GatewayError::Internal(e) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal error", e.to_string()),
        };

        (status, Json(json!({ "error": label, "message": message }))).into_response()
    }
}

impl From<crate::backends::BackendCallError> for GatewayError {
    fn from(e: crate::backends::BackendCallError) -> Self {
        use crate::backends::BackendCallError as B;
        match e {
            B::Timeout => GatewayError::Timeout,
            B::Connection(m) => GatewayError::Connection(m),
            B::Other(e) => GatewayError::Internal(e),
        }
    }
}
