//! Store traits used by the delivery engine

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::models::{
    Campaign, CampaignProgress, CampaignStatus, Device, MessageLog, NewCampaign, NewMessageLog,
    RearmRecurring, Recipient, RecurringUpdate, UserQuota,
};
use crate::quota::QuotaDecision;
use async_trait::async_trait;
use bulkline_common::config::QuotaConfig;
use bulkline_common::types::{CampaignId, DeviceId, RecipientId, UserId};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Transaction could not be serialized, retry")]
    Serialization,

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether retrying the same transaction may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Serialization)
    }
}

impl From<StoreError> for bulkline_common::Error {
    fn from(e: StoreError) -> Self {
        bulkline_common::Error::Database(e.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persisted campaigns, recipients and the message log.
///
/// Every status change is a conditional update on the current status, so
/// concurrent workers observe either the old or the new row, never a mix.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// Insert a campaign and its recipients atomically
    async fn create_campaign(&self, input: NewCampaign) -> StoreResult<Campaign>;

    async fn get_campaign(&self, id: CampaignId) -> StoreResult<Option<Campaign>>;

    async fn campaign_status(&self, id: CampaignId) -> StoreResult<Option<CampaignStatus>>;

    async fn get_device(&self, id: &DeviceId) -> StoreResult<Option<Device>>;

    async fn upsert_device(&self, device: Device) -> StoreResult<()>;

    /// Move to `to` only if the current status is one of `from`.
    /// Terminal targets stamp `completed_at`.
    async fn transition_status(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Campaign>>;

    /// `scheduled|running -> running`, stamping `started_at` if unset
    async fn mark_running(&self, id: CampaignId, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Take or renew the campaign lease. Succeeds when the lease is free,
    /// expired or already held by `holder`.
    async fn acquire_lease(
        &self,
        id: CampaignId,
        holder: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn release_lease(&self, id: CampaignId, holder: &str) -> StoreResult<()>;

    /// Pending recipients, oldest first
    async fn list_pending_recipients(&self, campaign_id: CampaignId) -> StoreResult<Vec<Recipient>>;

    async fn list_recipients(&self, campaign_id: CampaignId) -> StoreResult<Vec<Recipient>>;

    /// Atomic `pending -> sending`. False when another worker won the claim.
    async fn claim_recipient(&self, id: RecipientId, now: DateTime<Utc>) -> StoreResult<bool>;

    /// `sending -> sent`, bump `sent_count` and append the message log in one
    /// transaction
    async fn mark_recipient_sent(
        &self,
        id: RecipientId,
        campaign_id: CampaignId,
        sent_at: DateTime<Utc>,
        log: NewMessageLog,
    ) -> StoreResult<()>;

    /// `sending -> failed` with the error text, bump `failed_count`
    async fn mark_recipient_failed(
        &self,
        id: RecipientId,
        campaign_id: CampaignId,
        error: &str,
    ) -> StoreResult<()>;

    /// Fail every pending or sending recipient with `reason`, add them to
    /// `failed_count` and move the campaign to `failed`. Returns the number of
    /// recipients failed.
    async fn fail_campaign(
        &self,
        id: CampaignId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// `running -> completed` when no recipient is pending or sending.
    /// Recurring campaigns with exhausted runs are retired at the same time.
    async fn complete_campaign(&self, id: CampaignId, now: DateTime<Utc>) -> StoreResult<bool>;

    async fn campaign_progress(&self, id: CampaignId) -> StoreResult<CampaignProgress>;

    /// One-shot campaigns due at or before `until`
    async fn list_due_one_shot(&self, until: DateTime<Utc>) -> StoreResult<Vec<Campaign>>;

    /// Recurring campaigns in `scheduled` or `completed`
    async fn list_recurring_candidates(&self) -> StoreResult<Vec<Campaign>>;

    /// Running campaigns whose lease is absent or expired
    async fn list_interrupted(&self, now: DateTime<Utc>) -> StoreResult<Vec<Campaign>>;

    /// Stop scheduling a recurring campaign: `is_recurring = false`,
    /// `status = completed`, `next_run_at = NULL`
    async fn retire_recurring(&self, id: CampaignId, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Start a new cycle of a recurring campaign. Conditional on the campaign
    /// still being idle in `scheduled`/`completed` with the expected run count,
    /// so two instances cannot fire the same occurrence.
    async fn rearm_recurring(&self, id: CampaignId, rearm: RearmRecurring) -> StoreResult<bool>;

    /// Revert recipients stuck in `sending` since before `claimed_before`.
    /// Returns the affected campaign ids.
    async fn reclaim_stale(&self, claimed_before: DateTime<Utc>) -> StoreResult<Vec<CampaignId>>;

    /// Turn a `scheduled`/`paused` campaign into a one-shot send at `at`
    async fn schedule_once(
        &self,
        id: CampaignId,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Campaign>>;

    /// Set recurrence on a `scheduled`/`paused`/`completed` campaign and
    /// arm it
    async fn set_recurring(
        &self,
        id: CampaignId,
        update: RecurringUpdate,
    ) -> StoreResult<Option<Campaign>>;

    /// `paused -> scheduled`, refreshing `next_run_at` for recurring campaigns
    async fn resume_campaign(
        &self,
        id: CampaignId,
        next_run_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<Campaign>>;

    async fn list_message_logs(&self, campaign_id: CampaignId) -> StoreResult<Vec<MessageLog>>;
}

/// Per-user monthly usage counters
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Check and consume `cost` units in one serializable transaction.
    /// Users without a row are provisioned on the default plan.
    async fn consume_quota(
        &self,
        user_id: UserId,
        cost: i64,
        now: DateTime<Utc>,
        config: &QuotaConfig,
    ) -> StoreResult<QuotaDecision>;

    async fn get_quota(&self, user_id: UserId) -> StoreResult<Option<UserQuota>>;

    /// Assign a plan and optional explicit cap, keeping current usage
    async fn set_plan(
        &self,
        user_id: UserId,
        plan: &str,
        quota: Option<i64>,
        now: DateTime<Utc>,
    ) -> StoreResult<UserQuota>;
}
