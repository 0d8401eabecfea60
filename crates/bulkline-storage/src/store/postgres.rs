//! PostgreSQL store

use super::{CampaignStore, QuotaStore, StoreError, StoreResult};
use crate::db::DatabasePool;
use crate::models::{
    Campaign, CampaignProgress, CampaignStatus, Device, MessageLog, NewCampaign, NewMessageLog,
    RearmRecurring, Recipient, RecurringType, RecurringUpdate, UserQuota,
};
use crate::quota::QuotaDecision;
use async_trait::async_trait;
use bulkline_common::config::QuotaConfig;
use bulkline_common::types::{CampaignId, DeviceId, MediaKind, RecipientId, TimeOfDay, UserId};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

#[derive(sqlx::FromRow)]
struct CampaignRow {
    id: Uuid,
    owner_user_id: Option<Uuid>,
    device_id: String,
    name: String,
    message: String,
    media_url: Option<String>,
    total_recipients: i32,
    sent_count: i32,
    failed_count: i32,
    status: String,
    scheduled_at: Option<DateTime<Utc>>,
    timezone: String,
    is_recurring: bool,
    recurring_type: Option<String>,
    recurring_days: Vec<i32>,
    recurring_time: Option<String>,
    next_run_at: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
    run_count: i32,
    max_runs: Option<i32>,
    priority: i32,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    locked_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CampaignRow> for Campaign {
    type Error = StoreError;

    fn try_from(row: CampaignRow) -> StoreResult<Self> {
        let status = row.status.parse().map_err(StoreError::Corrupt)?;
        let recurring_type = row
            .recurring_type
            .as_deref()
            .map(str::parse::<RecurringType>)
            .transpose()
            .map_err(StoreError::Corrupt)?;
        let recurring_time = row
            .recurring_time
            .as_deref()
            .map(|t| {
                TimeOfDay::parse(t)
                    .ok_or_else(|| StoreError::Corrupt(format!("Invalid recurring_time: {}", t)))
            })
            .transpose()?;

        Ok(Campaign {
            id: row.id,
            owner_user_id: row.owner_user_id,
            device_id: row.device_id,
            name: row.name,
            message: row.message,
            media_url: row.media_url,
            total_recipients: row.total_recipients,
            sent_count: row.sent_count,
            failed_count: row.failed_count,
            status,
            scheduled_at: row.scheduled_at,
            timezone: row.timezone,
            is_recurring: row.is_recurring,
            recurring_type,
            recurring_days: row.recurring_days,
            recurring_time,
            next_run_at: row.next_run_at,
            last_run_at: row.last_run_at,
            run_count: row.run_count,
            max_runs: row.max_runs,
            priority: row.priority,
            started_at: row.started_at,
            completed_at: row.completed_at,
            locked_by: row.locked_by,
            locked_until: row.locked_until,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RecipientRow {
    id: Uuid,
    campaign_id: Uuid,
    phone: String,
    name: Option<String>,
    status: String,
    sent_at: Option<DateTime<Utc>>,
    error: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<RecipientRow> for Recipient {
    type Error = StoreError;

    fn try_from(row: RecipientRow) -> StoreResult<Self> {
        Ok(Recipient {
            id: row.id,
            campaign_id: row.campaign_id,
            phone: row.phone,
            name: row.name,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            sent_at: row.sent_at,
            error: row.error,
            claimed_at: row.claimed_at,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MessageLogRow {
    id: Uuid,
    campaign_id: Uuid,
    recipient_id: Uuid,
    device_id: String,
    owner_user_id: Option<Uuid>,
    phone: String,
    provider_message_id: String,
    media_kind: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageLogRow> for MessageLog {
    type Error = StoreError;

    fn try_from(row: MessageLogRow) -> StoreResult<Self> {
        let media_kind = row
            .media_kind
            .as_deref()
            .map(str::parse::<MediaKind>)
            .transpose()
            .map_err(|e: bulkline_common::Error| StoreError::Corrupt(e.to_string()))?;

        Ok(MessageLog {
            id: row.id,
            campaign_id: row.campaign_id,
            recipient_id: row.recipient_id,
            device_id: row.device_id,
            owner_user_id: row.owner_user_id,
            phone: row.phone,
            provider_message_id: row.provider_message_id,
            media_kind,
            created_at: row.created_at,
        })
    }
}

fn campaign(row: Option<CampaignRow>) -> StoreResult<Option<Campaign>> {
    row.map(Campaign::try_from).transpose()
}

fn campaigns(rows: Vec<CampaignRow>) -> StoreResult<Vec<Campaign>> {
    rows.into_iter().map(Campaign::try_from).collect()
}

fn recipients(rows: Vec<RecipientRow>) -> StoreResult<Vec<Recipient>> {
    rows.into_iter().map(Recipient::try_from).collect()
}

/// Map PostgreSQL serialization failures to the retryable variant
fn classify(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if matches!(
            db.code().as_deref(),
            Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED)
        ) {
            return StoreError::Serialization;
        }
    }
    StoreError::Database(e)
}

/// Store backed by PostgreSQL
#[derive(Clone)]
pub struct PgStore {
    db: DatabasePool,
}

impl PgStore {
    pub fn new(db: DatabasePool) -> Self {
        Self { db }
    }

    fn pool(&self) -> &PgPool {
        self.db.pool()
    }
}

#[async_trait]
impl CampaignStore for PgStore {
    async fn create_campaign(&self, input: NewCampaign) -> StoreResult<Campaign> {
        let id = Uuid::now_v7();
        let now = Utc::now();
        let (recurring_type, recurring_days, recurring_time) = match &input.recurrence {
            Some(rule) => (
                Some(rule.kind.as_str()),
                rule.days.clone(),
                Some(rule.time.to_string()),
            ),
            None => (None, Vec::new(), None),
        };

        let mut tx = self.pool().begin().await?;

        let row = sqlx::query_as::<_, CampaignRow>(
            r#"
            INSERT INTO campaigns (
                id, owner_user_id, device_id, name, message, media_url,
                total_recipients, status, scheduled_at, timezone, is_recurring,
                recurring_type, recurring_days, recurring_time, next_run_at,
                max_runs, priority, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'scheduled', $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $17)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.owner_user_id)
        .bind(&input.device_id)
        .bind(&input.name)
        .bind(&input.message)
        .bind(&input.media_url)
        .bind(input.recipients.len() as i32)
        .bind(input.scheduled_at)
        .bind(&input.timezone)
        .bind(input.recurrence.is_some())
        .bind(recurring_type)
        .bind(&recurring_days)
        .bind(recurring_time)
        .bind(input.next_run_at)
        .bind(input.max_runs)
        .bind(input.priority)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        for (offset, recipient) in input.recipients.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO recipients (id, campaign_id, phone, name, status, created_at)
                VALUES ($1, $2, $3, $4, 'pending', $5)
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(id)
            .bind(&recipient.phone)
            .bind(&recipient.name)
            .bind(now + chrono::Duration::microseconds(offset as i64))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Campaign::try_from(row)
    }

    async fn get_campaign(&self, id: CampaignId) -> StoreResult<Option<Campaign>> {
        let row = sqlx::query_as::<_, CampaignRow>("SELECT * FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        campaign(row)
    }

    async fn campaign_status(&self, id: CampaignId) -> StoreResult<Option<CampaignStatus>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM campaigns WHERE id = $1")
                .bind(id)
                .fetch_optional(self.pool())
                .await?;
        status
            .map(|s| s.parse().map_err(StoreError::Corrupt))
            .transpose()
    }

    async fn get_device(&self, id: &DeviceId) -> StoreResult<Option<Device>> {
        Ok(
            sqlx::query_as::<_, Device>("SELECT id, owner_user_id, name FROM devices WHERE id = $1")
                .bind(id)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    async fn upsert_device(&self, device: Device) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO devices (id, owner_user_id, name)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET
                owner_user_id = EXCLUDED.owner_user_id,
                name = EXCLUDED.name
            "#,
        )
        .bind(&device.id)
        .bind(device.owner_user_id)
        .bind(&device.name)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn transition_status(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Campaign>> {
        let from: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
        let row = sqlx::query_as::<_, CampaignRow>(
            r#"
            UPDATE campaigns SET
                status = $3,
                completed_at = CASE
                    WHEN $3 IN ('completed', 'failed', 'cancelled') THEN $4
                    ELSE completed_at
                END,
                updated_at = $4
            WHERE id = $1 AND status = ANY($2)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&from)
        .bind(to.as_str())
        .bind(now)
        .fetch_optional(self.pool())
        .await?;
        campaign(row)
    }

    async fn mark_running(&self, id: CampaignId, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns SET
                status = 'running',
                started_at = COALESCE(started_at, $2),
                updated_at = $2
            WHERE id = $1 AND status IN ('scheduled', 'running')
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn acquire_lease(
        &self,
        id: CampaignId,
        holder: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns SET locked_by = $2, locked_until = $4
            WHERE id = $1
              AND (locked_by IS NULL OR locked_by = $2 OR locked_until IS NULL OR locked_until < $3)
            "#,
        )
        .bind(id)
        .bind(holder)
        .bind(now)
        .bind(until)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, id: CampaignId, holder: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE campaigns SET locked_by = NULL, locked_until = NULL WHERE id = $1 AND locked_by = $2",
        )
        .bind(id)
        .bind(holder)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn list_pending_recipients(&self, campaign_id: CampaignId) -> StoreResult<Vec<Recipient>> {
        let rows = sqlx::query_as::<_, RecipientRow>(
            r#"
            SELECT * FROM recipients
            WHERE campaign_id = $1 AND status = 'pending'
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(campaign_id)
        .fetch_all(self.pool())
        .await?;
        recipients(rows)
    }

    async fn list_recipients(&self, campaign_id: CampaignId) -> StoreResult<Vec<Recipient>> {
        let rows = sqlx::query_as::<_, RecipientRow>(
            "SELECT * FROM recipients WHERE campaign_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(campaign_id)
        .fetch_all(self.pool())
        .await?;
        recipients(rows)
    }

    async fn claim_recipient(&self, id: RecipientId, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE recipients SET status = 'sending', claimed_at = $2 WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_recipient_sent(
        &self,
        id: RecipientId,
        campaign_id: CampaignId,
        sent_at: DateTime<Utc>,
        log: NewMessageLog,
    ) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE recipients SET status = 'sent', sent_at = $2, error = NULL
            WHERE id = $1 AND status = 'sending'
            "#,
        )
        .bind(id)
        .bind(sent_at)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            debug!(recipient_id = %id, "Recipient no longer sending, skipping sent update");
            tx.rollback().await?;
            return Ok(());
        }

        sqlx::query(
            "UPDATE campaigns SET sent_count = sent_count + 1, updated_at = $2 WHERE id = $1",
        )
        .bind(campaign_id)
        .bind(sent_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO message_logs (
                id, campaign_id, recipient_id, device_id, owner_user_id,
                phone, provider_message_id, media_kind, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(campaign_id)
        .bind(id)
        .bind(&log.device_id)
        .bind(log.owner_user_id)
        .bind(&log.phone)
        .bind(&log.provider_message_id)
        .bind(log.media_kind.map(|k| k.to_string()))
        .bind(sent_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn mark_recipient_failed(
        &self,
        id: RecipientId,
        campaign_id: CampaignId,
        error: &str,
    ) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;

        let updated = sqlx::query(
            "UPDATE recipients SET status = 'failed', error = $2 WHERE id = $1 AND status = 'sending'",
        )
        .bind(id)
        .bind(error)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(());
        }

        sqlx::query(
            "UPDATE campaigns SET failed_count = failed_count + 1, updated_at = NOW() WHERE id = $1",
        )
        .bind(campaign_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn fail_campaign(
        &self,
        id: CampaignId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut tx = self.pool().begin().await?;

        let failed = sqlx::query(
            r#"
            UPDATE recipients SET status = 'failed', error = $2
            WHERE campaign_id = $1 AND status IN ('pending', 'sending')
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            r#"
            UPDATE campaigns SET
                failed_count = failed_count + $2,
                status = 'failed',
                completed_at = $3,
                updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(failed as i32)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(failed)
    }

    async fn complete_campaign(&self, id: CampaignId, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns SET
                status = 'completed',
                completed_at = $2,
                updated_at = $2,
                is_recurring = CASE
                    WHEN max_runs IS NOT NULL AND run_count >= max_runs THEN FALSE
                    ELSE is_recurring
                END,
                next_run_at = CASE
                    WHEN is_recurring AND max_runs IS NOT NULL AND run_count >= max_runs THEN NULL
                    ELSE next_run_at
                END
            WHERE id = $1
              AND status = 'running'
              AND NOT EXISTS (
                  SELECT 1 FROM recipients
                  WHERE campaign_id = $1 AND status IN ('pending', 'sending')
              )
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn campaign_progress(&self, id: CampaignId) -> StoreResult<CampaignProgress> {
        let counts: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM recipients WHERE campaign_id = $1 GROUP BY status",
        )
        .bind(id)
        .fetch_all(self.pool())
        .await?;

        let mut progress = CampaignProgress::default();
        for (status, count) in counts {
            match status.as_str() {
                "pending" => progress.pending = count,
                "sending" => progress.sending = count,
                "sent" => progress.sent = count,
                "failed" => progress.failed = count,
                other => {
                    return Err(StoreError::Corrupt(format!(
                        "Invalid recipient status: {}",
                        other
                    )))
                }
            }
        }
        Ok(progress)
    }

    async fn list_due_one_shot(&self, until: DateTime<Utc>) -> StoreResult<Vec<Campaign>> {
        let rows = sqlx::query_as::<_, CampaignRow>(
            r#"
            SELECT * FROM campaigns
            WHERE status = 'scheduled'
              AND is_recurring = FALSE
              AND scheduled_at <= $1
            ORDER BY priority DESC, scheduled_at ASC
            "#,
        )
        .bind(until)
        .fetch_all(self.pool())
        .await?;
        campaigns(rows)
    }

    async fn list_recurring_candidates(&self) -> StoreResult<Vec<Campaign>> {
        let rows = sqlx::query_as::<_, CampaignRow>(
            r#"
            SELECT * FROM campaigns
            WHERE is_recurring = TRUE
              AND status IN ('scheduled', 'completed')
            ORDER BY priority DESC, created_at ASC
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        campaigns(rows)
    }

    async fn list_interrupted(&self, now: DateTime<Utc>) -> StoreResult<Vec<Campaign>> {
        let rows = sqlx::query_as::<_, CampaignRow>(
            r#"
            SELECT * FROM campaigns
            WHERE status = 'running'
              AND (locked_until IS NULL OR locked_until < $1)
            "#,
        )
        .bind(now)
        .fetch_all(self.pool())
        .await?;
        campaigns(rows)
    }

    async fn retire_recurring(&self, id: CampaignId, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns SET
                is_recurring = FALSE,
                status = 'completed',
                next_run_at = NULL,
                completed_at = COALESCE(completed_at, $2),
                updated_at = $2
            WHERE id = $1 AND status IN ('scheduled', 'completed')
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn rearm_recurring(&self, id: CampaignId, rearm: RearmRecurring) -> StoreResult<bool> {
        let mut tx = self.pool().begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE campaigns SET
                status = 'scheduled',
                run_count = run_count + 1,
                last_run_at = $3,
                next_run_at = $4,
                sent_count = 0,
                failed_count = 0,
                started_at = NULL,
                completed_at = NULL,
                updated_at = $3
            WHERE id = $1
              AND is_recurring = TRUE
              AND run_count = $2
              AND status IN ('scheduled', 'completed')
            "#,
        )
        .bind(id)
        .bind(rearm.expected_run_count)
        .bind(rearm.fired_at)
        .bind(rearm.next_run_at)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE recipients SET status = 'pending', sent_at = NULL, error = NULL, claimed_at = NULL
            WHERE campaign_id = $1
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn reclaim_stale(&self, claimed_before: DateTime<Utc>) -> StoreResult<Vec<CampaignId>> {
        let mut ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE recipients SET status = 'pending', claimed_at = NULL
            WHERE status = 'sending' AND (claimed_at IS NULL OR claimed_at < $1)
            RETURNING campaign_id
            "#,
        )
        .bind(claimed_before)
        .fetch_all(self.pool())
        .await?;
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn schedule_once(
        &self,
        id: CampaignId,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Campaign>> {
        let row = sqlx::query_as::<_, CampaignRow>(
            r#"
            UPDATE campaigns SET
                status = 'scheduled',
                scheduled_at = $2,
                is_recurring = FALSE,
                next_run_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('scheduled', 'paused')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(at)
        .fetch_optional(self.pool())
        .await?;
        campaign(row)
    }

    async fn set_recurring(
        &self,
        id: CampaignId,
        update: RecurringUpdate,
    ) -> StoreResult<Option<Campaign>> {
        let row = sqlx::query_as::<_, CampaignRow>(
            r#"
            UPDATE campaigns SET
                is_recurring = TRUE,
                recurring_type = $2,
                recurring_days = $3,
                recurring_time = $4,
                timezone = $5,
                max_runs = $6,
                next_run_at = $7,
                status = CASE WHEN status = 'paused' THEN 'scheduled' ELSE status END,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('scheduled', 'paused', 'completed')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(update.rule.kind.as_str())
        .bind(&update.rule.days)
        .bind(update.rule.time.to_string())
        .bind(&update.timezone)
        .bind(update.max_runs)
        .bind(update.next_run_at)
        .fetch_optional(self.pool())
        .await?;
        campaign(row)
    }

    async fn resume_campaign(
        &self,
        id: CampaignId,
        next_run_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<Campaign>> {
        let row = sqlx::query_as::<_, CampaignRow>(
            r#"
            UPDATE campaigns SET
                status = 'scheduled',
                next_run_at = COALESCE($2, next_run_at),
                updated_at = NOW()
            WHERE id = $1 AND status = 'paused'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(next_run_at)
        .fetch_optional(self.pool())
        .await?;
        campaign(row)
    }

    async fn list_message_logs(&self, campaign_id: CampaignId) -> StoreResult<Vec<MessageLog>> {
        let rows = sqlx::query_as::<_, MessageLogRow>(
            "SELECT * FROM message_logs WHERE campaign_id = $1 ORDER BY created_at ASC",
        )
        .bind(campaign_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(MessageLog::try_from).collect()
    }
}

#[async_trait]
impl QuotaStore for PgStore {
    async fn consume_quota(
        &self,
        user_id: UserId,
        cost: i64,
        now: DateTime<Utc>,
        config: &QuotaConfig,
    ) -> StoreResult<QuotaDecision> {
        let mut tx = self.pool().begin().await.map_err(classify)?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

        sqlx::query(
            r#"
            INSERT INTO user_quotas (user_id, plan, quota, used, last_reset)
            VALUES ($1, $2, NULL, 0, $3)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(&config.default_plan)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        let mut row = sqlx::query_as::<_, UserQuota>(
            r#"
            SELECT user_id, plan, quota, used, last_reset
            FROM user_quotas WHERE user_id = $1
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(classify)?;

        let decision = row.consume(cost, now, config);

        sqlx::query("UPDATE user_quotas SET used = $2, last_reset = $3 WHERE user_id = $1")
            .bind(user_id)
            .bind(row.used)
            .bind(row.last_reset)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

        tx.commit().await.map_err(classify)?;
        Ok(decision)
    }

    async fn get_quota(&self, user_id: UserId) -> StoreResult<Option<UserQuota>> {
        Ok(sqlx::query_as::<_, UserQuota>(
            "SELECT user_id, plan, quota, used, last_reset FROM user_quotas WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?)
    }

    async fn set_plan(
        &self,
        user_id: UserId,
        plan: &str,
        quota: Option<i64>,
        now: DateTime<Utc>,
    ) -> StoreResult<UserQuota> {
        Ok(sqlx::query_as::<_, UserQuota>(
            r#"
            INSERT INTO user_quotas (user_id, plan, quota, used, last_reset)
            VALUES ($1, $2, $3, 0, $4)
            ON CONFLICT (user_id) DO UPDATE SET
                plan = EXCLUDED.plan,
                quota = EXCLUDED.quota
            RETURNING user_id, plan, quota, used, last_reset
            "#,
        )
        .bind(user_id)
        .bind(plan)
        .bind(quota)
        .bind(now)
        .fetch_one(self.pool())
        .await?)
    }
}
