//! In-memory store
//!
//! Every operation runs under one mutex, which gives the same atomicity the
//! PostgreSQL store gets from conditional updates and transactions.

use super::{CampaignStore, QuotaStore, StoreResult};
use crate::models::{
    Campaign, CampaignProgress, CampaignStatus, Device, MessageLog, NewCampaign, NewMessageLog,
    RearmRecurring, Recipient, RecipientStatus, RecurringUpdate, UserQuota,
};
use crate::quota::QuotaDecision;
use async_trait::async_trait;
use bulkline_common::config::QuotaConfig;
use bulkline_common::types::{CampaignId, DeviceId, RecipientId, UserId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct State {
    campaigns: HashMap<CampaignId, Campaign>,
    /// Insertion order doubles as FIFO order
    recipients: Vec<Recipient>,
    devices: HashMap<DeviceId, Device>,
    message_logs: Vec<MessageLog>,
    quotas: HashMap<UserId, UserQuota>,
}

impl State {
    fn recipients_of(&self, campaign_id: CampaignId) -> impl Iterator<Item = &Recipient> {
        self.recipients
            .iter()
            .filter(move |r| r.campaign_id == campaign_id)
    }

    fn progress(&self, campaign_id: CampaignId) -> CampaignProgress {
        let mut progress = CampaignProgress::default();
        for r in self.recipients_of(campaign_id) {
            match r.status {
                RecipientStatus::Pending => progress.pending += 1,
                RecipientStatus::Sending => progress.sending += 1,
                RecipientStatus::Sent => progress.sent += 1,
                RecipientStatus::Failed => progress.failed += 1,
            }
        }
        progress
    }
}

/// Store keeping everything in process memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn touch(campaign: &mut Campaign, now: DateTime<Utc>) {
    campaign.updated_at = now;
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn create_campaign(&self, input: NewCampaign) -> StoreResult<Campaign> {
        let now = Utc::now();
        let id = Uuid::now_v7();
        let (recurring_type, recurring_days, recurring_time) = match &input.recurrence {
            Some(rule) => (Some(rule.kind), rule.days.clone(), Some(rule.time)),
            None => (None, Vec::new(), None),
        };

        let campaign = Campaign {
            id,
            owner_user_id: input.owner_user_id,
            device_id: input.device_id,
            name: input.name,
            message: input.message,
            media_url: input.media_url,
            total_recipients: input.recipients.len() as i32,
            sent_count: 0,
            failed_count: 0,
            status: CampaignStatus::Scheduled,
            scheduled_at: input.scheduled_at,
            timezone: input.timezone,
            is_recurring: input.recurrence.is_some(),
            recurring_type,
            recurring_days,
            recurring_time,
            next_run_at: input.next_run_at,
            last_run_at: None,
            run_count: 0,
            max_runs: input.max_runs,
            priority: input.priority,
            started_at: None,
            completed_at: None,
            locked_by: None,
            locked_until: None,
            created_at: now,
            updated_at: now,
        };

        let mut state = self.state();
        for (offset, r) in input.recipients.into_iter().enumerate() {
            state.recipients.push(Recipient {
                id: Uuid::now_v7(),
                campaign_id: id,
                phone: r.phone,
                name: r.name,
                status: RecipientStatus::Pending,
                sent_at: None,
                error: None,
                claimed_at: None,
                created_at: now + chrono::Duration::microseconds(offset as i64),
            });
        }
        state.campaigns.insert(id, campaign.clone());
        Ok(campaign)
    }

    async fn get_campaign(&self, id: CampaignId) -> StoreResult<Option<Campaign>> {
        Ok(self.state().campaigns.get(&id).cloned())
    }

    async fn campaign_status(&self, id: CampaignId) -> StoreResult<Option<CampaignStatus>> {
        Ok(self.state().campaigns.get(&id).map(|c| c.status))
    }

    async fn get_device(&self, id: &DeviceId) -> StoreResult<Option<Device>> {
        Ok(self.state().devices.get(id).cloned())
    }

    async fn upsert_device(&self, device: Device) -> StoreResult<()> {
        self.state().devices.insert(device.id.clone(), device);
        Ok(())
    }

    async fn transition_status(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Campaign>> {
        let mut state = self.state();
        let Some(campaign) = state.campaigns.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&campaign.status) {
            return Ok(None);
        }
        campaign.status = to;
        if matches!(
            to,
            CampaignStatus::Completed | CampaignStatus::Failed | CampaignStatus::Cancelled
        ) {
            campaign.completed_at = Some(now);
        }
        touch(campaign, now);
        Ok(Some(campaign.clone()))
    }

    async fn mark_running(&self, id: CampaignId, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut state = self.state();
        let Some(campaign) = state.campaigns.get_mut(&id) else {
            return Ok(false);
        };
        if !matches!(
            campaign.status,
            CampaignStatus::Scheduled | CampaignStatus::Running
        ) {
            return Ok(false);
        }
        campaign.status = CampaignStatus::Running;
        campaign.started_at.get_or_insert(now);
        touch(campaign, now);
        Ok(true)
    }

    async fn acquire_lease(
        &self,
        id: CampaignId,
        holder: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.state();
        let Some(campaign) = state.campaigns.get_mut(&id) else {
            return Ok(false);
        };
        let free = match (&campaign.locked_by, campaign.locked_until) {
            (None, _) => true,
            (Some(current), _) if current == holder => true,
            (Some(_), Some(expiry)) => expiry < now,
            (Some(_), None) => true,
        };
        if !free {
            return Ok(false);
        }
        campaign.locked_by = Some(holder.to_string());
        campaign.locked_until = Some(until);
        Ok(true)
    }

    async fn release_lease(&self, id: CampaignId, holder: &str) -> StoreResult<()> {
        let mut state = self.state();
        if let Some(campaign) = state.campaigns.get_mut(&id) {
            if campaign.locked_by.as_deref() == Some(holder) {
                campaign.locked_by = None;
                campaign.locked_until = None;
            }
        }
        Ok(())
    }

    async fn list_pending_recipients(&self, campaign_id: CampaignId) -> StoreResult<Vec<Recipient>> {
        let state = self.state();
        let mut pending: Vec<Recipient> = state
            .recipients_of(campaign_id)
            .filter(|r| r.status == RecipientStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| (r.created_at, r.id));
        Ok(pending)
    }

    async fn list_recipients(&self, campaign_id: CampaignId) -> StoreResult<Vec<Recipient>> {
        Ok(self.state().recipients_of(campaign_id).cloned().collect())
    }

    async fn claim_recipient(&self, id: RecipientId, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut state = self.state();
        match state.recipients.iter_mut().find(|r| r.id == id) {
            Some(r) if r.status == RecipientStatus::Pending => {
                r.status = RecipientStatus::Sending;
                r.claimed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_recipient_sent(
        &self,
        id: RecipientId,
        campaign_id: CampaignId,
        sent_at: DateTime<Utc>,
        log: NewMessageLog,
    ) -> StoreResult<()> {
        let mut state = self.state();
        let Some(recipient) = state
            .recipients
            .iter_mut()
            .find(|r| r.id == id && r.status == RecipientStatus::Sending)
        else {
            return Ok(());
        };
        recipient.status = RecipientStatus::Sent;
        recipient.sent_at = Some(sent_at);
        recipient.error = None;

        if let Some(campaign) = state.campaigns.get_mut(&campaign_id) {
            campaign.sent_count += 1;
            touch(campaign, sent_at);
        }
        state.message_logs.push(MessageLog {
            id: Uuid::now_v7(),
            campaign_id,
            recipient_id: id,
            device_id: log.device_id,
            owner_user_id: log.owner_user_id,
            phone: log.phone,
            provider_message_id: log.provider_message_id,
            media_kind: log.media_kind,
            created_at: sent_at,
        });
        Ok(())
    }

    async fn mark_recipient_failed(
        &self,
        id: RecipientId,
        campaign_id: CampaignId,
        error: &str,
    ) -> StoreResult<()> {
        let mut state = self.state();
        let Some(recipient) = state
            .recipients
            .iter_mut()
            .find(|r| r.id == id && r.status == RecipientStatus::Sending)
        else {
            return Ok(());
        };
        recipient.status = RecipientStatus::Failed;
        recipient.error = Some(error.to_string());

        if let Some(campaign) = state.campaigns.get_mut(&campaign_id) {
            campaign.failed_count += 1;
            touch(campaign, Utc::now());
        }
        Ok(())
    }

    async fn fail_campaign(
        &self,
        id: CampaignId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut state = self.state();
        let mut failed = 0u64;
        for r in state.recipients.iter_mut().filter(|r| {
            r.campaign_id == id
                && matches!(r.status, RecipientStatus::Pending | RecipientStatus::Sending)
        }) {
            r.status = RecipientStatus::Failed;
            r.error = Some(reason.to_string());
            failed += 1;
        }

        if let Some(campaign) = state.campaigns.get_mut(&id) {
            campaign.failed_count += failed as i32;
            campaign.status = CampaignStatus::Failed;
            campaign.completed_at = Some(now);
            touch(campaign, now);
        }
        Ok(failed)
    }

    async fn complete_campaign(&self, id: CampaignId, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut state = self.state();
        if state.progress(id).outstanding() > 0 {
            return Ok(false);
        }
        let Some(campaign) = state.campaigns.get_mut(&id) else {
            return Ok(false);
        };
        if campaign.status != CampaignStatus::Running {
            return Ok(false);
        }
        campaign.status = CampaignStatus::Completed;
        campaign.completed_at = Some(now);
        if campaign.is_recurring && campaign.runs_exhausted() {
            campaign.is_recurring = false;
            campaign.next_run_at = None;
        }
        touch(campaign, now);
        Ok(true)
    }

    async fn campaign_progress(&self, id: CampaignId) -> StoreResult<CampaignProgress> {
        Ok(self.state().progress(id))
    }

    async fn list_due_one_shot(&self, until: DateTime<Utc>) -> StoreResult<Vec<Campaign>> {
        let state = self.state();
        let mut due: Vec<Campaign> = state
            .campaigns
            .values()
            .filter(|c| {
                c.status == CampaignStatus::Scheduled
                    && !c.is_recurring
                    && matches!(c.scheduled_at, Some(at) if at <= until)
            })
            .cloned()
            .collect();
        due.sort_by_key(|c| (std::cmp::Reverse(c.priority), c.scheduled_at));
        Ok(due)
    }

    async fn list_recurring_candidates(&self) -> StoreResult<Vec<Campaign>> {
        let state = self.state();
        let mut candidates: Vec<Campaign> = state
            .campaigns
            .values()
            .filter(|c| {
                c.is_recurring
                    && matches!(
                        c.status,
                        CampaignStatus::Scheduled | CampaignStatus::Completed
                    )
            })
            .cloned()
            .collect();
        candidates.sort_by_key(|c| (std::cmp::Reverse(c.priority), c.created_at));
        Ok(candidates)
    }

    async fn list_interrupted(&self, now: DateTime<Utc>) -> StoreResult<Vec<Campaign>> {
        let state = self.state();
        Ok(state
            .campaigns
            .values()
            .filter(|c| {
                c.status == CampaignStatus::Running
                    && c.locked_until.map_or(true, |until| until < now)
            })
            .cloned()
            .collect())
    }

    async fn retire_recurring(&self, id: CampaignId, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut state = self.state();
        let Some(campaign) = state.campaigns.get_mut(&id) else {
            return Ok(false);
        };
        if !matches!(
            campaign.status,
            CampaignStatus::Scheduled | CampaignStatus::Completed
        ) {
            return Ok(false);
        }
        campaign.is_recurring = false;
        campaign.status = CampaignStatus::Completed;
        campaign.next_run_at = None;
        campaign.completed_at.get_or_insert(now);
        touch(campaign, now);
        Ok(true)
    }

    async fn rearm_recurring(&self, id: CampaignId, rearm: RearmRecurring) -> StoreResult<bool> {
        let mut state = self.state();
        let Some(campaign) = state.campaigns.get_mut(&id) else {
            return Ok(false);
        };
        if !campaign.is_recurring
            || campaign.run_count != rearm.expected_run_count
            || !matches!(
                campaign.status,
                CampaignStatus::Scheduled | CampaignStatus::Completed
            )
        {
            return Ok(false);
        }
        campaign.status = CampaignStatus::Scheduled;
        campaign.run_count += 1;
        campaign.last_run_at = Some(rearm.fired_at);
        campaign.next_run_at = rearm.next_run_at;
        campaign.sent_count = 0;
        campaign.failed_count = 0;
        campaign.started_at = None;
        campaign.completed_at = None;
        touch(campaign, rearm.fired_at);

        for r in state.recipients.iter_mut().filter(|r| r.campaign_id == id) {
            r.status = RecipientStatus::Pending;
            r.sent_at = None;
            r.error = None;
            r.claimed_at = None;
        }
        Ok(true)
    }

    async fn reclaim_stale(&self, claimed_before: DateTime<Utc>) -> StoreResult<Vec<CampaignId>> {
        let mut state = self.state();
        let mut campaigns = Vec::new();
        for r in state.recipients.iter_mut().filter(|r| {
            r.status == RecipientStatus::Sending
                && r.claimed_at.map_or(true, |at| at < claimed_before)
        }) {
            r.status = RecipientStatus::Pending;
            r.claimed_at = None;
            if !campaigns.contains(&r.campaign_id) {
                campaigns.push(r.campaign_id);
            }
        }
        Ok(campaigns)
    }

    async fn schedule_once(
        &self,
        id: CampaignId,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Campaign>> {
        let mut state = self.state();
        let Some(campaign) = state.campaigns.get_mut(&id) else {
            return Ok(None);
        };
        if !matches!(
            campaign.status,
            CampaignStatus::Scheduled | CampaignStatus::Paused
        ) {
            return Ok(None);
        }
        campaign.status = CampaignStatus::Scheduled;
        campaign.scheduled_at = Some(at);
        campaign.is_recurring = false;
        campaign.next_run_at = None;
        touch(campaign, Utc::now());
        Ok(Some(campaign.clone()))
    }

    async fn set_recurring(
        &self,
        id: CampaignId,
        update: RecurringUpdate,
    ) -> StoreResult<Option<Campaign>> {
        let mut state = self.state();
        let Some(campaign) = state.campaigns.get_mut(&id) else {
            return Ok(None);
        };
        if !matches!(
            campaign.status,
            CampaignStatus::Scheduled | CampaignStatus::Paused | CampaignStatus::Completed
        ) {
            return Ok(None);
        }
        campaign.is_recurring = true;
        campaign.recurring_type = Some(update.rule.kind);
        campaign.recurring_days = update.rule.days;
        campaign.recurring_time = Some(update.rule.time);
        campaign.timezone = update.timezone;
        campaign.max_runs = update.max_runs;
        campaign.next_run_at = Some(update.next_run_at);
        if campaign.status == CampaignStatus::Paused {
            campaign.status = CampaignStatus::Scheduled;
        }
        touch(campaign, Utc::now());
        Ok(Some(campaign.clone()))
    }

    async fn resume_campaign(
        &self,
        id: CampaignId,
        next_run_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<Campaign>> {
        let mut state = self.state();
        let Some(campaign) = state.campaigns.get_mut(&id) else {
            return Ok(None);
        };
        if campaign.status != CampaignStatus::Paused {
            return Ok(None);
        }
        campaign.status = CampaignStatus::Scheduled;
        if next_run_at.is_some() {
            campaign.next_run_at = next_run_at;
        }
        touch(campaign, Utc::now());
        Ok(Some(campaign.clone()))
    }

    async fn list_message_logs(&self, campaign_id: CampaignId) -> StoreResult<Vec<MessageLog>> {
        Ok(self
            .state()
            .message_logs
            .iter()
            .filter(|l| l.campaign_id == campaign_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn consume_quota(
        &self,
        user_id: UserId,
        cost: i64,
        now: DateTime<Utc>,
        config: &QuotaConfig,
    ) -> StoreResult<QuotaDecision> {
        let mut state = self.state();
        let row = state
            .quotas
            .entry(user_id)
            .or_insert_with(|| UserQuota::new(user_id, config.default_plan.clone(), now));
        Ok(row.consume(cost, now, config))
    }

    async fn get_quota(&self, user_id: UserId) -> StoreResult<Option<UserQuota>> {
        Ok(self.state().quotas.get(&user_id).cloned())
    }

    async fn set_plan(
        &self,
        user_id: UserId,
        plan: &str,
        quota: Option<i64>,
        now: DateTime<Utc>,
    ) -> StoreResult<UserQuota> {
        let mut state = self.state();
        let row = state
            .quotas
            .entry(user_id)
            .or_insert_with(|| UserQuota::new(user_id, plan, now));
        row.plan = plan.to_string();
        row.quota = quota;
        Ok(row.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewRecipient;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn new_campaign(recipients: usize) -> NewCampaign {
        NewCampaign {
            owner_user_id: Some(Uuid::new_v4()),
            device_id: "device-1".to_string(),
            name: "Promo".to_string(),
            message: "Hello".to_string(),
            media_url: None,
            scheduled_at: Some(Utc::now()),
            timezone: "UTC".to_string(),
            recurrence: None,
            next_run_at: None,
            max_runs: None,
            priority: 0,
            recipients: (0..recipients)
                .map(|i| NewRecipient {
                    phone: format!("62812000{:04}", i),
                    name: None,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_create_sets_total_and_fifo_order() {
        let store = MemoryStore::new();
        let campaign = store.create_campaign(new_campaign(3)).await.unwrap();
        assert_eq!(campaign.total_recipients, 3);
        assert_eq!(campaign.status, CampaignStatus::Scheduled);

        let pending = store.list_pending_recipients(campaign.id).await.unwrap();
        let phones: Vec<_> = pending.iter().map(|r| r.phone.as_str()).collect();
        assert_eq!(phones, vec!["628120000000", "628120000001", "628120000002"]);
    }

    #[tokio::test]
    async fn test_concurrent_claims_only_one_wins() {
        let store = Arc::new(MemoryStore::new());
        let campaign = store.create_campaign(new_campaign(1)).await.unwrap();
        let recipient = store.list_pending_recipients(campaign.id).await.unwrap()[0].clone();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.claim_recipient(recipient.id, Utc::now()).await })
            })
            .collect();

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_sent_requires_claim() {
        let store = MemoryStore::new();
        let campaign = store.create_campaign(new_campaign(1)).await.unwrap();
        let recipient = store.list_pending_recipients(campaign.id).await.unwrap()[0].clone();
        let log = NewMessageLog {
            device_id: "device-1".to_string(),
            owner_user_id: None,
            phone: recipient.phone.clone(),
            provider_message_id: "m-1".to_string(),
            media_kind: None,
        };

        store
            .mark_recipient_sent(recipient.id, campaign.id, Utc::now(), log.clone())
            .await
            .unwrap();
        let unchanged = store.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(unchanged.sent_count, 0, "unclaimed recipient must not be marked sent");

        assert!(store.claim_recipient(recipient.id, Utc::now()).await.unwrap());
        store
            .mark_recipient_sent(recipient.id, campaign.id, Utc::now(), log)
            .await
            .unwrap();
        let updated = store.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(updated.sent_count, 1);
        assert_eq!(store.list_message_logs(campaign.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lease_exclusive_until_expiry() {
        let store = MemoryStore::new();
        let campaign = store.create_campaign(new_campaign(1)).await.unwrap();
        let now = Utc::now();
        let until = now + chrono::Duration::seconds(60);

        assert!(store.acquire_lease(campaign.id, "a", now, until).await.unwrap());
        assert!(!store.acquire_lease(campaign.id, "b", now, until).await.unwrap());
        assert!(store.acquire_lease(campaign.id, "a", now, until).await.unwrap());

        let later = until + chrono::Duration::seconds(1);
        assert!(store
            .acquire_lease(campaign.id, "b", later, later + chrono::Duration::seconds(60))
            .await
            .unwrap());

        store.release_lease(campaign.id, "a").await.unwrap();
        let held = store.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(held.locked_by.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_reclaim_stale_sending() {
        let store = MemoryStore::new();
        let campaign = store.create_campaign(new_campaign(2)).await.unwrap();
        let pending = store.list_pending_recipients(campaign.id).await.unwrap();
        let long_ago = Utc::now() - chrono::Duration::minutes(30);
        store.claim_recipient(pending[0].id, long_ago).await.unwrap();
        store.claim_recipient(pending[1].id, Utc::now()).await.unwrap();

        let reclaimed = store
            .reclaim_stale(Utc::now() - chrono::Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(reclaimed, vec![campaign.id]);

        let progress = store.campaign_progress(campaign.id).await.unwrap();
        assert_eq!(progress.pending, 1);
        assert_eq!(progress.sending, 1);
    }

    #[tokio::test]
    async fn test_quota_provisions_default_plan() {
        let store = MemoryStore::new();
        let config = QuotaConfig::default();
        let user = Uuid::new_v4();

        let decision = store
            .consume_quota(user, 1, Utc::now(), &config)
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, Some(99));

        let row = store.get_quota(user).await.unwrap().unwrap();
        assert_eq!(row.plan, "free");
        assert_eq!(row.used, 1);
    }
}
