//! Error-to-response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::ops::OpsError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Ops(#[from] OpsError),
    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Ops(OpsError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ApiError::Ops(OpsError::InvalidState(_)) => StatusCode::CONFLICT,
            ApiError::Ops(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        let body = Json(json!({ "error": { "status": status.as_u16(), "message": self.to_string() } }));
        (status, body).into_response()
    }
}
