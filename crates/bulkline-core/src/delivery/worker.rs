//! Delivery worker - sends one campaign to its pending recipients

use super::tracker::InFlightTracker;
use crate::quota::QuotaGate;
use crate::transport::{MessagingTransport, SendReceipt, TransportError};
use bulkline_common::config::DeliveryConfig;
use bulkline_common::types::{CampaignId, MediaKind};
use bulkline_storage::{
    Campaign, CampaignStatus, CampaignStore, Device, NewMessageLog, Recipient, StoreError,
    QUOTA_EXCEEDED_REASON,
};
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What a call to [`DeliveryWorker::process_campaign`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Another task in this process is already working on the campaign
    AlreadyInFlight,
    /// Campaign or its device does not exist
    NotFound,
    /// Campaign is in a status the worker does not act on
    Skipped(CampaignStatus),
    /// Device is offline; nothing was changed
    DeviceUnavailable,
    /// Another instance holds the campaign lease
    LeaseHeld,
    /// Lease was taken over mid-run; the new holder continues
    LeaseLost,
    /// Every recipient reached a terminal status
    Completed { sent: u32, failed: u32 },
    /// Quota ran out; remaining recipients were failed with the campaign
    QuotaExceeded { sent: u32, failed: u64 },
    /// Campaign was cancelled or paused between recipients
    Stopped(CampaignStatus),
    /// Some recipients are still pending or sending after the pass
    Incomplete { outstanding: i64 },
    /// Store failure outside the per-recipient path
    StoreError(String),
}

/// Processes campaigns: claims recipients, gates them on quota, sends
/// through the transport and finalizes the campaign.
pub struct DeliveryWorker {
    store: Arc<dyn CampaignStore>,
    quota: Arc<QuotaGate>,
    transport: Arc<dyn MessagingTransport>,
    tracker: InFlightTracker,
    config: DeliveryConfig,
    /// Lease holder name
    instance_id: String,
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        quota: Arc<QuotaGate>,
        transport: Arc<dyn MessagingTransport>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            store,
            quota,
            transport,
            tracker: InFlightTracker::new(),
            config,
            instance_id: "bulkline".to_string(),
        }
    }

    /// Share an existing in-flight tracker
    pub fn with_tracker(mut self, tracker: InFlightTracker) -> Self {
        self.tracker = tracker;
        self
    }

    /// Set the name this worker takes campaign leases under
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn tracker(&self) -> &InFlightTracker {
        &self.tracker
    }

    /// Process a campaign in the background
    pub fn trigger(self: &Arc<Self>, id: CampaignId) -> JoinHandle<ProcessOutcome> {
        let worker = Arc::clone(self);
        tokio::spawn(async move { worker.process_campaign(id).await })
    }

    /// Run one delivery pass over `id`.
    ///
    /// Idempotent and never fails: errors are logged and reflected in the
    /// returned outcome and in persisted state.
    pub async fn process_campaign(&self, id: CampaignId) -> ProcessOutcome {
        let Some(_guard) = self.tracker.try_enter(id) else {
            debug!(campaign_id = %id, "Campaign already in flight, skipping");
            return ProcessOutcome::AlreadyInFlight;
        };

        match self.process(id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(campaign_id = %id, error = %e, "Campaign processing failed");
                ProcessOutcome::StoreError(e.to_string())
            }
        }
    }

    async fn process(&self, id: CampaignId) -> Result<ProcessOutcome, StoreError> {
        let Some(campaign) = self.store.get_campaign(id).await? else {
            warn!(campaign_id = %id, "Campaign not found");
            return Ok(ProcessOutcome::NotFound);
        };
        if campaign.status.is_idle() {
            debug!(campaign_id = %id, status = %campaign.status, "Campaign idle, nothing to do");
            return Ok(ProcessOutcome::Skipped(campaign.status));
        }

        let Some(device) = self.store.get_device(&campaign.device_id).await? else {
            warn!(campaign_id = %id, device_id = %campaign.device_id, "Device not found");
            return Ok(ProcessOutcome::NotFound);
        };

        if !self.device_ready(&device).await {
            return Ok(ProcessOutcome::DeviceUnavailable);
        }

        let now = Utc::now();
        if !self
            .store
            .acquire_lease(id, &self.instance_id, now, self.lease_until())
            .await?
        {
            debug!(campaign_id = %id, "Campaign leased by another instance");
            return Ok(ProcessOutcome::LeaseHeld);
        }

        let result = self.run_leased(campaign, device).await;

        if let Err(e) = self.store.release_lease(id, &self.instance_id).await {
            warn!(campaign_id = %id, error = %e, "Failed to release campaign lease");
        }

        result
    }

    async fn device_ready(&self, device: &Device) -> bool {
        let check = tokio::time::timeout(self.send_timeout(), self.transport.is_connected(&device.id));
        match check.await {
            Ok(Ok(true)) => true,
            Ok(Ok(false)) => {
                warn!(device_id = %device.id, "Device not connected, deferring campaign");
                false
            }
            Ok(Err(e)) => {
                warn!(device_id = %device.id, error = %e, "Device status check failed, deferring campaign");
                false
            }
            Err(_) => {
                warn!(device_id = %device.id, "Device status check timed out, deferring campaign");
                false
            }
        }
    }

    async fn run_leased(
        &self,
        campaign: Campaign,
        device: Device,
    ) -> Result<ProcessOutcome, StoreError> {
        let id = campaign.id;

        if !self.store.mark_running(id, Utc::now()).await? {
            let status = self
                .store
                .campaign_status(id)
                .await?
                .unwrap_or(campaign.status);
            return Ok(ProcessOutcome::Skipped(status));
        }

        let pending = self.store.list_pending_recipients(id).await?;
        let owner = campaign.owner_user_id.or(device.owner_user_id);
        let cost = campaign.send_cost();

        info!(
            campaign_id = %id,
            device_id = %device.id,
            pending = pending.len(),
            "Delivering campaign"
        );
        if owner.is_none() {
            warn!(campaign_id = %id, "No quota owner for campaign, sends are not metered");
        }

        let mut sent = 0u32;
        let mut failed = 0u32;
        let total = pending.len();

        for (index, recipient) in pending.iter().enumerate() {
            match self.store.campaign_status(id).await? {
                Some(CampaignStatus::Running) => {}
                Some(status) => {
                    info!(campaign_id = %id, status = %status, "Campaign stopped mid-run");
                    return Ok(ProcessOutcome::Stopped(status));
                }
                None => return Ok(ProcessOutcome::NotFound),
            }

            let now = Utc::now();
            if !self
                .store
                .acquire_lease(id, &self.instance_id, now, self.lease_until())
                .await?
            {
                warn!(campaign_id = %id, "Campaign lease lost, stopping");
                return Ok(ProcessOutcome::LeaseLost);
            }

            match self.store.claim_recipient(recipient.id, now).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(recipient_id = %recipient.id, "Recipient claimed elsewhere, skipping");
                    continue;
                }
                Err(e) => {
                    error!(recipient_id = %recipient.id, error = %e, "Failed to claim recipient");
                    continue;
                }
            }

            if let Some(owner) = owner {
                let decision = self.quota.check_and_increment(owner, cost).await;
                if !decision.allowed {
                    let failed_now = self
                        .store
                        .fail_campaign(id, QUOTA_EXCEEDED_REASON, Utc::now())
                        .await?;
                    warn!(
                        campaign_id = %id,
                        user_id = %owner,
                        failed = failed_now,
                        reason = decision.reason.as_deref().unwrap_or(QUOTA_EXCEEDED_REASON),
                        "Quota exhausted, campaign failed"
                    );
                    return Ok(ProcessOutcome::QuotaExceeded {
                        sent,
                        failed: failed_now,
                    });
                }
            }

            match self.send(&campaign, &device, recipient).await {
                Ok(receipt) => {
                    let log = NewMessageLog {
                        device_id: device.id.clone(),
                        owner_user_id: owner,
                        phone: recipient.phone.clone(),
                        provider_message_id: receipt.message_id,
                        media_kind: campaign.media_kind(),
                    };
                    // A recipient left in `sending` here is picked up by the
                    // stale-claim sweep
                    if let Err(e) = self
                        .store
                        .mark_recipient_sent(recipient.id, id, Utc::now(), log)
                        .await
                    {
                        error!(recipient_id = %recipient.id, error = %e, "Failed to record sent message");
                    }
                    sent += 1;
                }
                Err(e) => {
                    warn!(
                        campaign_id = %id,
                        recipient_id = %recipient.id,
                        error = %e,
                        "Send failed"
                    );
                    if let Err(store_err) = self
                        .store
                        .mark_recipient_failed(recipient.id, id, &e.to_string())
                        .await
                    {
                        error!(recipient_id = %recipient.id, error = %store_err, "Failed to record send failure");
                    }
                    failed += 1;
                }
            }

            if index + 1 < total {
                tokio::time::sleep(self.pacing_delay()).await;
            }
        }

        if self.store.complete_campaign(id, Utc::now()).await? {
            info!(campaign_id = %id, sent, failed, "Campaign completed");
            return Ok(ProcessOutcome::Completed { sent, failed });
        }

        match self.store.campaign_status(id).await? {
            Some(CampaignStatus::Running) => {
                let progress = self.store.campaign_progress(id).await?;
                info!(
                    campaign_id = %id,
                    pending = progress.pending,
                    sending = progress.sending,
                    "Campaign pass finished with outstanding recipients"
                );
                Ok(ProcessOutcome::Incomplete {
                    outstanding: progress.outstanding(),
                })
            }
            Some(status) => Ok(ProcessOutcome::Stopped(status)),
            None => Ok(ProcessOutcome::NotFound),
        }
    }

    async fn send(
        &self,
        campaign: &Campaign,
        device: &Device,
        recipient: &Recipient,
    ) -> Result<SendReceipt, TransportError> {
        let send = async {
            match campaign.media_url.as_deref() {
                Some(url) => {
                    let caption = Some(campaign.message.as_str()).filter(|m| !m.trim().is_empty());
                    self.transport
                        .send_media(MediaKind::from_url(url), &device.id, &recipient.phone, url, caption)
                        .await
                }
                None => {
                    self.transport
                        .send_text(&device.id, &recipient.phone, &campaign.message)
                        .await
                }
            }
        };

        tokio::time::timeout(self.send_timeout(), send)
            .await
            .unwrap_or(Err(TransportError::Timeout(self.config.send_timeout_secs)))
    }

    fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.config.send_timeout_secs)
    }

    fn lease_until(&self) -> chrono::DateTime<Utc> {
        Utc::now() + ChronoDuration::seconds(self.config.lease_secs)
    }

    /// Uniform random pause between consecutive sends
    fn pacing_delay(&self) -> Duration {
        let (min, max) = (self.config.min_delay_ms, self.config.max_delay_ms);
        let ms = if min >= max {
            min
        } else {
            rand::thread_rng().gen_range(min..=max)
        };
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bulkline_common::config::{PlanQuota, QuotaConfig, UnlimitedMarker};
    use bulkline_common::types::DeviceId;
    use bulkline_storage::{MemoryStore, NewCampaign, NewRecipient, RecipientStatus};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use uuid::Uuid;

    const DEVICE: &str = "device-1";

    /// Transport double with a fixed connection state, per-phone failures and
    /// an optional hook run on every send
    #[derive(Default)]
    struct ScriptedTransport {
        offline: bool,
        hang: bool,
        failing_phones: Vec<String>,
        sent: Mutex<Vec<(String, Option<MediaKind>, Option<String>)>>,
        store: Option<Arc<MemoryStore>>,
        cancel_after: Option<(CampaignId, usize)>,
        observe: Option<(CampaignId, i32)>,
    }

    impl ScriptedTransport {
        fn sent(&self) -> Vec<(String, Option<MediaKind>, Option<String>)> {
            self.sent.lock().unwrap().clone()
        }

        async fn record(
            &self,
            to: &str,
            kind: Option<MediaKind>,
            caption: Option<&str>,
        ) -> Result<SendReceipt, TransportError> {
            if self.hang {
                std::future::pending::<()>().await;
            }

            if let (Some(store), Some((campaign_id, total))) = (&self.store, self.observe) {
                let progress = store.campaign_progress(campaign_id).await.unwrap();
                assert_eq!(progress.total(), total as i64);
                assert_eq!(progress.sending, 1);
            }

            if self.failing_phones.iter().any(|p| p == to) {
                return Err(TransportError::Rejected {
                    status: 400,
                    message: "number not on network".to_string(),
                });
            }

            let count = {
                let mut sent = self.sent.lock().unwrap();
                sent.push((to.to_string(), kind, caption.map(str::to_string)));
                sent.len()
            };

            if let (Some(store), Some((campaign_id, after))) = (&self.store, self.cancel_after) {
                if count == after {
                    store
                        .transition_status(
                            campaign_id,
                            &[CampaignStatus::Running],
                            CampaignStatus::Cancelled,
                            Utc::now(),
                        )
                        .await
                        .unwrap();
                }
            }

            Ok(SendReceipt {
                to: to.to_string(),
                message_id: format!("msg-{}", count),
            })
        }
    }

    #[async_trait]
    impl MessagingTransport for ScriptedTransport {
        async fn is_connected(&self, _device: &DeviceId) -> Result<bool, TransportError> {
            Ok(!self.offline)
        }

        async fn send_text(
            &self,
            _device: &DeviceId,
            to: &str,
            _text: &str,
        ) -> Result<SendReceipt, TransportError> {
            self.record(to, None, None).await
        }

        async fn send_media(
            &self,
            kind: MediaKind,
            _device: &DeviceId,
            to: &str,
            _url: &str,
            caption: Option<&str>,
        ) -> Result<SendReceipt, TransportError> {
            self.record(to, Some(kind), caption).await
        }
    }

    fn quota_config(cap: Option<i64>) -> QuotaConfig {
        let plan = match cap {
            Some(cap) => PlanQuota::Messages(cap),
            None => PlanQuota::Unlimited(UnlimitedMarker::Unlimited),
        };
        QuotaConfig {
            default_plan: "test".to_string(),
            plans: HashMap::from([("test".to_string(), plan)]),
            max_retries: 3,
        }
    }

    fn delivery_config() -> DeliveryConfig {
        DeliveryConfig {
            min_delay_ms: 0,
            max_delay_ms: 0,
            send_timeout_secs: 30,
            lease_secs: 120,
        }
    }

    async fn setup(
        store: &Arc<MemoryStore>,
        owner: Option<Uuid>,
        device_owner: Option<Uuid>,
        phones: &[&str],
        media_url: Option<&str>,
    ) -> Campaign {
        store
            .upsert_device(Device {
                id: DEVICE.to_string(),
                owner_user_id: device_owner,
                name: None,
            })
            .await
            .unwrap();

        store
            .create_campaign(NewCampaign {
                owner_user_id: owner,
                device_id: DEVICE.to_string(),
                name: "Launch".to_string(),
                message: "Big sale today".to_string(),
                media_url: media_url.map(str::to_string),
                scheduled_at: Some(Utc::now()),
                timezone: "UTC".to_string(),
                recurrence: None,
                next_run_at: None,
                max_runs: None,
                priority: 0,
                recipients: phones
                    .iter()
                    .map(|p| NewRecipient {
                        phone: p.to_string(),
                        name: None,
                    })
                    .collect(),
            })
            .await
            .unwrap()
    }

    fn worker(
        store: &Arc<MemoryStore>,
        transport: Arc<ScriptedTransport>,
        cap: Option<i64>,
        config: DeliveryConfig,
    ) -> DeliveryWorker {
        let quota = Arc::new(QuotaGate::new(store.clone(), quota_config(cap)));
        DeliveryWorker::new(store.clone(), quota, transport, config).with_instance_id("test-worker")
    }

    fn statuses(recipients: &[Recipient]) -> Vec<RecipientStatus> {
        recipients.iter().map(|r| r.status).collect()
    }

    #[tokio::test]
    async fn test_sends_to_every_recipient() {
        let store = Arc::new(MemoryStore::new());
        let campaign = setup(&store, Some(Uuid::new_v4()), None, &["1", "2", "3"], None).await;
        let transport = Arc::new(ScriptedTransport {
            store: Some(store.clone()),
            observe: Some((campaign.id, 3)),
            ..Default::default()
        });
        let worker = worker(&store, transport.clone(), None, delivery_config());

        let outcome = worker.process_campaign(campaign.id).await;
        assert_eq!(outcome, ProcessOutcome::Completed { sent: 3, failed: 0 });

        let done = store.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(done.status, CampaignStatus::Completed);
        assert_eq!(done.sent_count, 3);
        assert_eq!(done.failed_count, 0);
        assert!(done.started_at.is_some());
        assert!(done.completed_at.is_some());
        assert_eq!(done.locked_by, None);

        let phones: Vec<_> = transport.sent().into_iter().map(|(to, _, _)| to).collect();
        assert_eq!(phones, vec!["1", "2", "3"]);
        assert_eq!(store.list_message_logs(campaign.id).await.unwrap().len(), 3);
        assert!(worker.tracker().is_empty());
    }

    #[tokio::test]
    async fn test_quota_exhaustion_fails_the_rest() {
        let store = Arc::new(MemoryStore::new());
        // Only the device carries an owner
        let campaign = setup(&store, None, Some(Uuid::new_v4()), &["1", "2", "3"], None).await;
        let transport = Arc::new(ScriptedTransport::default());
        let worker = worker(&store, transport.clone(), Some(1), delivery_config());

        let outcome = worker.process_campaign(campaign.id).await;
        assert_eq!(outcome, ProcessOutcome::QuotaExceeded { sent: 1, failed: 2 });

        let done = store.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(done.status, CampaignStatus::Failed);
        assert_eq!(done.sent_count, 1);
        assert_eq!(done.failed_count, 2);
        assert!(done.completed_at.is_some());

        let recipients = store.list_recipients(campaign.id).await.unwrap();
        assert_eq!(
            statuses(&recipients),
            vec![RecipientStatus::Sent, RecipientStatus::Failed, RecipientStatus::Failed]
        );
        assert!(recipients[1..]
            .iter()
            .all(|r| r.error.as_deref() == Some(QUOTA_EXCEEDED_REASON)));
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnected_device_changes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let campaign = setup(&store, Some(Uuid::new_v4()), None, &["1", "2"], None).await;
        let transport = Arc::new(ScriptedTransport {
            offline: true,
            ..Default::default()
        });
        let worker = worker(&store, transport.clone(), Some(0), delivery_config());

        let outcome = worker.process_campaign(campaign.id).await;
        assert_eq!(outcome, ProcessOutcome::DeviceUnavailable);

        let after = store.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(after.status, CampaignStatus::Scheduled);
        assert_eq!(after.started_at, None);
        assert_eq!(after.locked_by, None);
        assert_eq!(after.updated_at, campaign.updated_at);
        let recipients = store.list_recipients(campaign.id).await.unwrap();
        assert_eq!(
            statuses(&recipients),
            vec![RecipientStatus::Pending, RecipientStatus::Pending]
        );
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_is_recorded_and_run_continues() {
        let store = Arc::new(MemoryStore::new());
        let campaign = setup(&store, None, None, &["1", "bad", "3"], None).await;
        let transport = Arc::new(ScriptedTransport {
            failing_phones: vec!["bad".to_string()],
            ..Default::default()
        });
        let worker = worker(&store, transport, Some(0), delivery_config());

        let outcome = worker.process_campaign(campaign.id).await;
        assert_eq!(outcome, ProcessOutcome::Completed { sent: 2, failed: 1 });

        let recipients = store.list_recipients(campaign.id).await.unwrap();
        assert_eq!(
            recipients[1].error.as_deref(),
            Some("Gateway rejected the message (400): number not on network")
        );
        let done = store.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(done.status, CampaignStatus::Completed);
        assert_eq!((done.sent_count, done.failed_count), (2, 1));
    }

    #[tokio::test]
    async fn test_media_with_caption_costs_two() {
        let store = Arc::new(MemoryStore::new());
        let campaign = setup(
            &store,
            Some(Uuid::new_v4()),
            None,
            &["1", "2"],
            Some("https://cdn.example.com/catalogue.pdf"),
        )
        .await;
        let transport = Arc::new(ScriptedTransport::default());
        let worker = worker(&store, transport.clone(), Some(3), delivery_config());

        let outcome = worker.process_campaign(campaign.id).await;
        assert_eq!(outcome, ProcessOutcome::QuotaExceeded { sent: 1, failed: 1 });
        assert_eq!(
            transport.sent(),
            vec![(
                "1".to_string(),
                Some(MediaKind::Document),
                Some("Big sale today".to_string())
            )]
        );

        let logs = store.list_message_logs(campaign.id).await.unwrap();
        assert_eq!(logs[0].media_kind, Some(MediaKind::Document));
    }

    #[tokio::test]
    async fn test_cancel_between_recipients() {
        let store = Arc::new(MemoryStore::new());
        let campaign = setup(&store, None, None, &["1", "2", "3"], None).await;
        let transport = Arc::new(ScriptedTransport {
            store: Some(store.clone()),
            cancel_after: Some((campaign.id, 1)),
            ..Default::default()
        });
        let worker = worker(&store, transport, Some(0), delivery_config());

        let outcome = worker.process_campaign(campaign.id).await;
        assert_eq!(outcome, ProcessOutcome::Stopped(CampaignStatus::Cancelled));

        let recipients = store.list_recipients(campaign.id).await.unwrap();
        assert_eq!(
            statuses(&recipients),
            vec![RecipientStatus::Sent, RecipientStatus::Pending, RecipientStatus::Pending]
        );
        let after = store.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(after.status, CampaignStatus::Cancelled);
        assert_eq!(after.locked_by, None);
    }

    #[tokio::test]
    async fn test_idle_and_in_flight_campaigns_are_noops() {
        let store = Arc::new(MemoryStore::new());
        let campaign = setup(&store, None, None, &["1"], None).await;
        let transport = Arc::new(ScriptedTransport::default());
        let worker = worker(&store, transport.clone(), Some(0), delivery_config());

        let guard = worker.tracker().try_enter(campaign.id).unwrap();
        assert_eq!(
            worker.process_campaign(campaign.id).await,
            ProcessOutcome::AlreadyInFlight
        );
        drop(guard);

        store
            .transition_status(
                campaign.id,
                &[CampaignStatus::Scheduled],
                CampaignStatus::Paused,
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(
            worker.process_campaign(campaign.id).await,
            ProcessOutcome::Skipped(CampaignStatus::Paused)
        );
        assert_eq!(
            worker.process_campaign(Uuid::new_v4()).await,
            ProcessOutcome::NotFound
        );
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_lease_held_elsewhere() {
        let store = Arc::new(MemoryStore::new());
        let campaign = setup(&store, None, None, &["1"], None).await;
        let now = Utc::now();
        store
            .acquire_lease(campaign.id, "other-instance", now, now + ChronoDuration::minutes(5))
            .await
            .unwrap();

        let worker = worker(&store, Arc::new(ScriptedTransport::default()), Some(0), delivery_config());
        assert_eq!(
            worker.process_campaign(campaign.id).await,
            ProcessOutcome::LeaseHeld
        );
        let after = store.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(after.status, CampaignStatus::Scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_skipped_after_last_recipient() {
        let store = Arc::new(MemoryStore::new());
        let campaign = setup(&store, None, None, &["1", "2", "3"], None).await;
        let config = DeliveryConfig {
            min_delay_ms: 1_000,
            max_delay_ms: 1_000,
            ..delivery_config()
        };
        let worker = worker(&store, Arc::new(ScriptedTransport::default()), Some(0), config);

        let started = tokio::time::Instant::now();
        worker.process_campaign(campaign.id).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout_fails_recipient() {
        let store = Arc::new(MemoryStore::new());
        let campaign = setup(&store, None, None, &["1"], None).await;
        let transport = Arc::new(ScriptedTransport {
            hang: true,
            ..Default::default()
        });
        let worker = worker(&store, transport, Some(0), delivery_config());

        let outcome = worker.process_campaign(campaign.id).await;
        assert_eq!(outcome, ProcessOutcome::Completed { sent: 0, failed: 1 });
        let recipients = store.list_recipients(campaign.id).await.unwrap();
        assert_eq!(recipients[0].error.as_deref(), Some("Send timed out after 30s"));
    }

    #[tokio::test]
    async fn test_trigger_runs_in_background() {
        let store = Arc::new(MemoryStore::new());
        let campaign = setup(&store, None, None, &["1", "2"], None).await;
        let worker = Arc::new(worker(
            &store,
            Arc::new(ScriptedTransport::default()),
            Some(0),
            delivery_config(),
        ));

        let handle = worker.trigger(campaign.id);
        assert_eq!(
            handle.await.unwrap(),
            ProcessOutcome::Completed { sent: 2, failed: 0 }
        );
    }
}
