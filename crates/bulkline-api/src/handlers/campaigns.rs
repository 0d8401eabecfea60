//! Campaign handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use bulkline_common::types::CampaignId;
use bulkline_core::{CreateCampaign, ProgressReport};
use bulkline_storage::{Campaign, RecurrenceRule};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{error_response, ApiResult};
use crate::state::AppState;

/// Campaign response
#[derive(Debug, Serialize, Deserialize)]
pub struct CampaignResponse {
    #[serde(flatten)]
    pub campaign: Campaign,
    pub progress_percentage: f64,
}

impl From<Campaign> for CampaignResponse {
    fn from(campaign: Campaign) -> Self {
        let progress_percentage = campaign.progress_percentage();
        Self {
            campaign,
            progress_percentage,
        }
    }
}

/// Request body for scheduling a one-shot send
#[derive(Debug, Deserialize)]
pub struct ScheduleCampaignRequest {
    pub scheduled_at: DateTime<Utc>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Request body for making a campaign recurring
#[derive(Debug, Deserialize)]
pub struct SetRecurringRequest {
    #[serde(flatten)]
    pub rule: RecurrenceRule,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub max_runs: Option<i32>,
}

/// Create a campaign with its recipients
pub async fn create_campaign(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateCampaign>,
) -> ApiResult<(StatusCode, Json<CampaignResponse>)> {
    let campaign = state.manager.create(req).await.map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(campaign.into())))
}

/// Get a campaign
pub async fn get_campaign(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<CampaignId>,
) -> ApiResult<Json<CampaignResponse>> {
    let campaign = state
        .manager
        .get(campaign_id)
        .await
        .map_err(error_response)?;
    Ok(Json(campaign.into()))
}

/// Recipient counts by status
pub async fn get_campaign_progress(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<CampaignId>,
) -> ApiResult<Json<ProgressReport>> {
    state
        .manager
        .progress(campaign_id)
        .await
        .map(Json)
        .map_err(error_response)
}

/// Schedule a one-shot send
pub async fn schedule_campaign(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<CampaignId>,
    Json(req): Json<ScheduleCampaignRequest>,
) -> ApiResult<Json<CampaignResponse>> {
    let campaign = state
        .manager
        .schedule(campaign_id, req.scheduled_at)
        .await
        .map_err(error_response)?;
    Ok(Json(campaign.into()))
}

/// Set recurrence parameters
pub async fn set_recurring(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<CampaignId>,
    Json(req): Json<SetRecurringRequest>,
) -> ApiResult<Json<CampaignResponse>> {
    let campaign = state
        .manager
        .set_recurring(campaign_id, req.rule, req.timezone, req.max_runs)
        .await
        .map_err(error_response)?;
    Ok(Json(campaign.into()))
}

/// Start delivery now; the run continues in the background
pub async fn run_campaign(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<CampaignId>,
) -> ApiResult<(StatusCode, Json<CampaignResponse>)> {
    let campaign = state
        .manager
        .run_now(campaign_id)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::ACCEPTED, Json(campaign.into())))
}

/// Pause a campaign
pub async fn pause_campaign(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<CampaignId>,
) -> ApiResult<Json<CampaignResponse>> {
    let campaign = state
        .manager
        .pause(campaign_id)
        .await
        .map_err(error_response)?;
    Ok(Json(campaign.into()))
}

/// Resume a paused campaign
pub async fn resume_campaign(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<CampaignId>,
) -> ApiResult<Json<CampaignResponse>> {
    let campaign = state
        .manager
        .resume(campaign_id)
        .await
        .map_err(error_response)?;
    Ok(Json(campaign.into()))
}

/// Cancel a campaign
pub async fn cancel_campaign(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<CampaignId>,
) -> ApiResult<Json<CampaignResponse>> {
    let campaign = state
        .manager
        .cancel(campaign_id)
        .await
        .map_err(error_response)?;
    Ok(Json(campaign.into()))
}
