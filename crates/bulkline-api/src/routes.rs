//! API routes

use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::handlers::{campaigns, devices, health, quota};
use crate::state::AppState;

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let health_routes = Router::new()
        .route("/", get(health::health))
        .route("/ready", get(health::readiness))
        .with_state(state.clone());

    let campaign_routes = Router::new()
        .route("/", post(campaigns::create_campaign))
        .route("/:campaign_id", get(campaigns::get_campaign))
        .route("/:campaign_id/progress", get(campaigns::get_campaign_progress))
        .route("/:campaign_id/schedule", post(campaigns::schedule_campaign))
        .route("/:campaign_id/recurring", put(campaigns::set_recurring))
        .route("/:campaign_id/run", post(campaigns::run_campaign))
        .route("/:campaign_id/pause", post(campaigns::pause_campaign))
        .route("/:campaign_id/resume", post(campaigns::resume_campaign))
        .route("/:campaign_id/cancel", post(campaigns::cancel_campaign));

    let device_routes = Router::new().route("/:device_id", put(devices::register_device));

    let quota_routes = Router::new()
        .route("/:user_id", get(quota::get_usage))
        .route("/:user_id", put(quota::set_plan));

    let api_v1 = Router::new()
        .nest("/campaigns", campaign_routes)
        .nest("/devices", device_routes)
        .nest("/quota", quota_routes)
        .with_state(state);

    Router::new()
        .nest("/health", health_routes)
        .nest("/api/v1", api_v1)
        .layer(TraceLayer::new_for_http())
}
