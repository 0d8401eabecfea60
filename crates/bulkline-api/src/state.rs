//! Shared handler state

use bulkline_core::{CampaignManager, QuotaGate};
use bulkline_storage::DatabasePool;
use std::sync::Arc;

/// Application state shared across handlers
pub struct AppState {
    pub manager: Arc<CampaignManager>,
    pub quota: Arc<QuotaGate>,
    /// Present when campaigns live in PostgreSQL
    pub db_pool: Option<DatabasePool>,
}
