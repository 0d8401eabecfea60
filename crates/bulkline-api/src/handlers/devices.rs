//! Device handlers

use axum::{
    extract::{Path, State},
    Json,
};
use bulkline_common::types::{DeviceId, UserId};
use bulkline_storage::Device;
use serde::Deserialize;
use std::sync::Arc;

use super::{error_response, ApiResult};
use crate::state::AppState;

/// Request body for registering a device
#[derive(Debug, Deserialize)]
pub struct RegisterDeviceRequest {
    pub owner_user_id: Option<UserId>,
    pub name: Option<String>,
}

/// Register or update a send device
pub async fn register_device(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<DeviceId>,
    Json(req): Json<RegisterDeviceRequest>,
) -> ApiResult<Json<Device>> {
    state
        .manager
        .register_device(Device {
            id: device_id,
            owner_user_id: req.owner_user_id,
            name: req.name,
        })
        .await
        .map(Json)
        .map_err(error_response)
}
