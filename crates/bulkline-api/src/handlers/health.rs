//! Health check handlers

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::state::AppState;

/// Basic health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Basic health check
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        error: None,
    })
}

/// Readiness check. The in-memory backend is always ready.
pub async fn readiness(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<HealthResponse>) {
    let ready = (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ready".to_string(),
            error: None,
        }),
    );
    let Some(pool) = &state.db_pool else {
        return ready;
    };

    match pool.health_check().await {
        Ok(()) => ready,
        Err(e) => {
            warn!("Readiness check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unavailable".to_string(),
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}
