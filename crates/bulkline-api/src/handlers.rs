//! API request handlers

pub mod campaigns;
pub mod devices;
pub mod health;
pub mod quota;

use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::error;

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

pub type ApiResult<T> = Result<T, (StatusCode, Json<ErrorResponse>)>;

/// Map any layer's error onto its HTTP status and error code
pub fn error_response(e: impl Into<bulkline_common::Error>) -> (StatusCode, Json<ErrorResponse>) {
    let e = e.into();
    let status =
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!(code = e.code(), "Request failed: {}", e);
    }
    (
        status,
        Json(ErrorResponse {
            error: e.code().to_string(),
            message: e.to_string(),
        }),
    )
}
