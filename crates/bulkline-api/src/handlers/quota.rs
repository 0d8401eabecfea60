//! Quota handlers

use axum::{
    extract::{Path, State},
    Json,
};
use bulkline_common::types::UserId;
use bulkline_common::Error;
use bulkline_core::QuotaUsage;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use super::{error_response, ApiResult};
use crate::state::AppState;

/// Request body for assigning a plan
#[derive(Debug, Deserialize)]
pub struct SetPlanRequest {
    pub plan: String,
    /// Explicit monthly cap overriding the plan default
    pub quota: Option<i64>,
}

/// Current month's usage
pub async fn get_usage(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<UserId>,
) -> ApiResult<Json<QuotaUsage>> {
    state
        .quota
        .usage(user_id)
        .await
        .map(Json)
        .map_err(error_response)
}

/// Assign a plan to a user
pub async fn set_plan(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<UserId>,
    Json(req): Json<SetPlanRequest>,
) -> ApiResult<Json<QuotaUsage>> {
    if !state.quota.config().plans.contains_key(&req.plan) {
        return Err(error_response(Error::Validation(format!(
            "Unknown plan: {}",
            req.plan
        ))));
    }
    if matches!(req.quota, Some(q) if q < 0) {
        return Err(error_response(Error::Validation(
            "quota must not be negative".to_string(),
        )));
    }

    let usage = state
        .quota
        .set_plan(user_id, &req.plan, req.quota)
        .await
        .map_err(error_response)?;

    info!(user_id = %user_id, plan = %usage.plan, "Quota plan assigned");
    Ok(Json(usage))
}
