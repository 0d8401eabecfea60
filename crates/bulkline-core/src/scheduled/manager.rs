//! Campaign manager - control surface for campaign lifecycle

use crate::delivery::DeliveryWorker;
use crate::recurrence::{self, RecurrenceError};
use bulkline_common::types::{CampaignId, DeviceId, UserId};
use bulkline_storage::{
    Campaign, CampaignStatus, CampaignStore, Device, NewCampaign, NewRecipient, RecurrenceRule,
    RecurringUpdate, StoreError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Campaign manager errors
#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Campaign not found")]
    NotFound,

    #[error("Device {0} is not registered")]
    DeviceNotFound(DeviceId),

    #[error("Cannot {action} a {status} campaign")]
    InvalidState {
        action: &'static str,
        status: CampaignStatus,
    },

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Recurrence(#[from] RecurrenceError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<CampaignError> for bulkline_common::Error {
    fn from(e: CampaignError) -> Self {
        use bulkline_common::Error;
        match e {
            CampaignError::NotFound => Error::NotFound("Campaign not found".to_string()),
            CampaignError::DeviceNotFound(_) => Error::NotFound(e.to_string()),
            CampaignError::InvalidState { .. } => Error::Conflict(e.to_string()),
            CampaignError::Validation(_) | CampaignError::Recurrence(_) => {
                Error::Validation(e.to_string())
            }
            CampaignError::Store(e) => e.into(),
        }
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Create campaign request
#[derive(Debug, Clone, Deserialize)]
pub struct CreateCampaign {
    pub owner_user_id: Option<UserId>,
    pub device_id: DeviceId,
    pub name: String,
    #[serde(default)]
    pub message: String,
    pub media_url: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub recurrence: Option<RecurrenceRule>,
    pub max_runs: Option<i32>,
    #[serde(default)]
    pub priority: i32,
    pub recipients: Vec<NewRecipient>,
}

/// Delivery progress of one campaign
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub campaign_id: CampaignId,
    pub status: CampaignStatus,
    pub total: i32,
    pub pending: i64,
    pub sending: i64,
    pub sent: i64,
    pub failed: i64,
    pub percentage: f64,
}

/// Campaign Manager - Manages campaign lifecycle
pub struct CampaignManager {
    store: Arc<dyn CampaignStore>,
    worker: Arc<DeliveryWorker>,
}

impl CampaignManager {
    pub fn new(store: Arc<dyn CampaignStore>, worker: Arc<DeliveryWorker>) -> Self {
        Self { store, worker }
    }

    /// Register or update a send device
    pub async fn register_device(&self, device: Device) -> Result<Device, CampaignError> {
        if device.id.trim().is_empty() {
            return Err(CampaignError::Validation("Device id is required".to_string()));
        }
        self.store.upsert_device(device.clone()).await?;
        Ok(device)
    }

    /// Create a campaign with its recipients
    pub async fn create(&self, input: CreateCampaign) -> Result<Campaign, CampaignError> {
        if input.name.trim().is_empty() {
            return Err(CampaignError::Validation("Campaign name is required".to_string()));
        }
        if input.message.trim().is_empty() && input.media_url.is_none() {
            return Err(CampaignError::Validation(
                "Campaign needs a message or a media attachment".to_string(),
            ));
        }
        if input.recipients.is_empty() {
            return Err(CampaignError::Validation(
                "Campaign needs at least one recipient".to_string(),
            ));
        }
        if let Some(r) = input.recipients.iter().find(|r| r.phone.trim().is_empty()) {
            return Err(CampaignError::Validation(format!(
                "Recipient {:?} has no phone number",
                r.name.as_deref().unwrap_or("")
            )));
        }
        if matches!(input.max_runs, Some(n) if n < 1) {
            return Err(CampaignError::Validation("max_runs must be at least 1".to_string()));
        }

        recurrence::parse_timezone(&input.timezone)?;

        if self.store.get_device(&input.device_id).await?.is_none() {
            return Err(CampaignError::DeviceNotFound(input.device_id));
        }

        let next_run_at = match &input.recurrence {
            Some(rule) => Some(recurrence::next_run(rule, &input.timezone, Utc::now())?),
            None => None,
        };

        let campaign = self
            .store
            .create_campaign(NewCampaign {
                owner_user_id: input.owner_user_id,
                device_id: input.device_id,
                name: input.name,
                message: input.message,
                media_url: input.media_url,
                scheduled_at: if input.recurrence.is_some() {
                    None
                } else {
                    input.scheduled_at
                },
                timezone: input.timezone,
                recurrence: input.recurrence,
                next_run_at,
                max_runs: input.max_runs,
                priority: input.priority,
                recipients: input
                    .recipients
                    .into_iter()
                    .map(|r| NewRecipient {
                        phone: r.phone.trim().to_string(),
                        name: r.name,
                    })
                    .collect(),
            })
            .await?;

        info!(
            campaign_id = %campaign.id,
            recipients = campaign.total_recipients,
            recurring = campaign.is_recurring,
            "Campaign created"
        );
        Ok(campaign)
    }

    pub async fn get(&self, id: CampaignId) -> Result<Campaign, CampaignError> {
        self.store
            .get_campaign(id)
            .await?
            .ok_or(CampaignError::NotFound)
    }

    /// Counts by recipient status
    pub async fn progress(&self, id: CampaignId) -> Result<ProgressReport, CampaignError> {
        let campaign = self.get(id).await?;
        let counts = self.store.campaign_progress(id).await?;

        Ok(ProgressReport {
            campaign_id: id,
            status: campaign.status,
            total: campaign.total_recipients,
            pending: counts.pending,
            sending: counts.sending,
            sent: counts.sent,
            failed: counts.failed,
            percentage: campaign.progress_percentage(),
        })
    }

    /// Cancel a campaign. A running campaign stops before its next recipient.
    pub async fn cancel(&self, id: CampaignId) -> Result<Campaign, CampaignError> {
        self.transition(
            id,
            "cancel",
            &[
                CampaignStatus::Scheduled,
                CampaignStatus::Running,
                CampaignStatus::Paused,
            ],
            CampaignStatus::Cancelled,
        )
        .await
    }

    /// Pause a campaign. A running campaign stops before its next recipient.
    pub async fn pause(&self, id: CampaignId) -> Result<Campaign, CampaignError> {
        self.transition(
            id,
            "pause",
            &[CampaignStatus::Scheduled, CampaignStatus::Running],
            CampaignStatus::Paused,
        )
        .await
    }

    /// Resume a paused campaign.
    ///
    /// Recurring campaigns get a fresh `next_run_at`. A campaign paused with
    /// recipients still outstanding is delivered again right away when it is
    /// already due.
    pub async fn resume(&self, id: CampaignId) -> Result<Campaign, CampaignError> {
        let current = self.get(id).await?;
        if current.status != CampaignStatus::Paused {
            return Err(CampaignError::InvalidState {
                action: "resume",
                status: current.status,
            });
        }

        let now = Utc::now();
        let next_run_at = match current.recurrence() {
            Some(rule) => Some(recurrence::next_run(&rule, &current.timezone, now)?),
            None => None,
        };

        let campaign = self
            .store
            .resume_campaign(id, next_run_at)
            .await?
            .ok_or(CampaignError::InvalidState {
                action: "resume",
                status: current.status,
            })?;

        let outstanding = self.store.campaign_progress(id).await?.outstanding();
        let due = if campaign.is_recurring {
            campaign.run_count > 0
        } else {
            campaign.scheduled_at.map_or(true, |at| at <= now)
        };
        if outstanding > 0 && due {
            self.worker.trigger(id);
        }

        info!(campaign_id = %id, "Campaign resumed");
        Ok(campaign)
    }

    /// Make a campaign a one-shot send at `at`
    pub async fn schedule(
        &self,
        id: CampaignId,
        at: DateTime<Utc>,
    ) -> Result<Campaign, CampaignError> {
        let current = self.get(id).await?;
        let campaign = self
            .store
            .schedule_once(id, at)
            .await?
            .ok_or(CampaignError::InvalidState {
                action: "schedule",
                status: current.status,
            })?;

        info!(campaign_id = %id, scheduled_at = %at, "Campaign scheduled");
        Ok(campaign)
    }

    /// Set or replace the recurrence of a campaign
    pub async fn set_recurring(
        &self,
        id: CampaignId,
        rule: RecurrenceRule,
        timezone: String,
        max_runs: Option<i32>,
    ) -> Result<Campaign, CampaignError> {
        if matches!(max_runs, Some(n) if n < 1) {
            return Err(CampaignError::Validation("max_runs must be at least 1".to_string()));
        }
        let next_run_at = recurrence::next_run(&rule, &timezone, Utc::now())?;

        let current = self.get(id).await?;
        let campaign = self
            .store
            .set_recurring(
                id,
                RecurringUpdate {
                    rule,
                    timezone,
                    max_runs,
                    next_run_at,
                },
            )
            .await?
            .ok_or(CampaignError::InvalidState {
                action: "set recurrence on",
                status: current.status,
            })?;

        info!(campaign_id = %id, next_run_at = %next_run_at, "Campaign recurrence set");
        Ok(campaign)
    }

    /// Hand a scheduled campaign to the delivery worker immediately
    pub async fn run_now(&self, id: CampaignId) -> Result<Campaign, CampaignError> {
        let campaign = self.get(id).await?;
        if campaign.status != CampaignStatus::Scheduled {
            return Err(CampaignError::InvalidState {
                action: "run",
                status: campaign.status,
            });
        }

        info!(campaign_id = %id, "Campaign run requested");
        self.worker.trigger(id);
        Ok(campaign)
    }

    async fn transition(
        &self,
        id: CampaignId,
        action: &'static str,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<Campaign, CampaignError> {
        let current = self.get(id).await?;
        if !current.status.can_transition_to(to) || !from.contains(&current.status) {
            return Err(CampaignError::InvalidState {
                action,
                status: current.status,
            });
        }

        let campaign = self
            .store
            .transition_status(id, from, to, Utc::now())
            .await?
            .ok_or(CampaignError::InvalidState {
                action,
                status: current.status,
            })?;

        info!(campaign_id = %id, from = %current.status, to = %to, "Campaign status changed");
        Ok(campaign)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::ProcessOutcome;
    use crate::quota::QuotaGate;
    use crate::transport::{MessagingTransport, SendReceipt, TransportError};
    use async_trait::async_trait;
    use bulkline_common::config::{DeliveryConfig, QuotaConfig};
    use bulkline_common::types::{MediaKind, TimeOfDay};
    use bulkline_storage::{MemoryStore, RecurringType};
    use pretty_assertions::assert_eq;

    struct EchoTransport;

    #[async_trait]
    impl MessagingTransport for EchoTransport {
        async fn is_connected(&self, _device: &DeviceId) -> Result<bool, TransportError> {
            Ok(true)
        }

        async fn send_text(
            &self,
            _device: &DeviceId,
            to: &str,
            _text: &str,
        ) -> Result<SendReceipt, TransportError> {
            Ok(SendReceipt {
                to: to.to_string(),
                message_id: "m".to_string(),
            })
        }

        async fn send_media(
            &self,
            _kind: MediaKind,
            device: &DeviceId,
            to: &str,
            _url: &str,
            _caption: Option<&str>,
        ) -> Result<SendReceipt, TransportError> {
            self.send_text(device, to, "").await
        }
    }

    async fn manager() -> (Arc<MemoryStore>, Arc<DeliveryWorker>, CampaignManager) {
        let store = Arc::new(MemoryStore::new());
        let quota = Arc::new(QuotaGate::new(store.clone(), QuotaConfig::default()));
        let worker = Arc::new(DeliveryWorker::new(
            store.clone(),
            quota,
            Arc::new(EchoTransport),
            DeliveryConfig {
                min_delay_ms: 0,
                max_delay_ms: 0,
                send_timeout_secs: 30,
                lease_secs: 120,
            },
        ));
        let manager = CampaignManager::new(store.clone(), worker.clone());
        manager
            .register_device(Device {
                id: "device-1".to_string(),
                owner_user_id: None,
                name: Some("Front desk".to_string()),
            })
            .await
            .unwrap();
        (store, worker, manager)
    }

    fn request() -> CreateCampaign {
        CreateCampaign {
            owner_user_id: None,
            device_id: "device-1".to_string(),
            name: "Opening".to_string(),
            message: "We are open".to_string(),
            media_url: None,
            scheduled_at: Some(Utc::now() + chrono::Duration::hours(1)),
            timezone: "Asia/Jakarta".to_string(),
            recurrence: None,
            max_runs: None,
            priority: 0,
            recipients: vec![
                NewRecipient {
                    phone: " 6281 ".to_string(),
                    name: Some("Ayu".to_string()),
                },
                NewRecipient {
                    phone: "6282".to_string(),
                    name: None,
                },
            ],
        }
    }

    #[tokio::test]
    async fn test_create_validates_input() {
        let (_, _, manager) = manager().await;

        let campaign = manager.create(request()).await.unwrap();
        assert_eq!(campaign.total_recipients, 2);
        assert_eq!(campaign.status, CampaignStatus::Scheduled);

        let mut empty = request();
        empty.recipients.clear();
        assert!(matches!(
            manager.create(empty).await,
            Err(CampaignError::Validation(_))
        ));

        let mut bad_zone = request();
        bad_zone.timezone = "Nowhere/City".to_string();
        assert!(matches!(
            manager.create(bad_zone).await,
            Err(CampaignError::Recurrence(RecurrenceError::InvalidTimezone(_)))
        ));

        let mut unknown_device = request();
        unknown_device.device_id = "device-9".to_string();
        assert!(matches!(
            manager.create(unknown_device).await,
            Err(CampaignError::DeviceNotFound(_))
        ));

        let mut no_days = request();
        no_days.recurrence = Some(RecurrenceRule {
            kind: RecurringType::Weekly,
            days: vec![],
            time: TimeOfDay::new(9, 0).unwrap(),
        });
        assert!(matches!(
            manager.create(no_days).await,
            Err(CampaignError::Recurrence(RecurrenceError::MissingWeekdays))
        ));
    }

    #[tokio::test]
    async fn test_recurring_create_sets_next_run() {
        let (_, _, manager) = manager().await;
        let mut input = request();
        input.recurrence = Some(RecurrenceRule {
            kind: RecurringType::Daily,
            days: vec![],
            time: TimeOfDay::new(9, 0).unwrap(),
        });
        input.max_runs = Some(3);

        let campaign = manager.create(input).await.unwrap();
        assert!(campaign.is_recurring);
        assert_eq!(campaign.scheduled_at, None);
        assert!(campaign.next_run_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let (_, _, manager) = manager().await;
        let campaign = manager.create(request()).await.unwrap();

        let paused = manager.pause(campaign.id).await.unwrap();
        assert_eq!(paused.status, CampaignStatus::Paused);
        assert!(matches!(
            manager.run_now(campaign.id).await,
            Err(CampaignError::InvalidState { action: "run", .. })
        ));

        let resumed = manager.resume(campaign.id).await.unwrap();
        assert_eq!(resumed.status, CampaignStatus::Scheduled);

        let at = Utc::now() + chrono::Duration::days(1);
        let rescheduled = manager.schedule(campaign.id, at).await.unwrap();
        assert_eq!(rescheduled.scheduled_at, Some(at));

        let cancelled = manager.cancel(campaign.id).await.unwrap();
        assert_eq!(cancelled.status, CampaignStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());

        assert!(matches!(
            manager.resume(campaign.id).await,
            Err(CampaignError::InvalidState { .. })
        ));
        assert!(matches!(
            manager.cancel(uuid::Uuid::new_v4()).await,
            Err(CampaignError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_set_recurring_on_scheduled_campaign() {
        let (_, _, manager) = manager().await;
        let campaign = manager.create(request()).await.unwrap();

        let rule = RecurrenceRule {
            kind: RecurringType::Monthly,
            days: vec![1, 15],
            time: TimeOfDay::new(8, 30).unwrap(),
        };
        let updated = manager
            .set_recurring(campaign.id, rule.clone(), "Asia/Jakarta".to_string(), Some(6))
            .await
            .unwrap();
        assert_eq!(updated.recurrence(), Some(rule));
        assert_eq!(updated.max_runs, Some(6));
        assert!(updated.next_run_at.is_some());
    }

    #[tokio::test]
    async fn test_run_now_and_progress() {
        let (store, worker, manager) = manager().await;
        let campaign = manager.create(request()).await.unwrap();

        manager.run_now(campaign.id).await.unwrap();
        // The triggered task and this one race; drive it to completion here
        let outcome = worker.process_campaign(campaign.id).await;
        assert!(matches!(
            outcome,
            ProcessOutcome::Completed { .. }
                | ProcessOutcome::AlreadyInFlight
                | ProcessOutcome::Skipped(CampaignStatus::Completed)
        ));

        for _ in 0..100 {
            if store.campaign_status(campaign.id).await.unwrap() == Some(CampaignStatus::Completed) {
                break;
            }
            tokio::task::yield_now().await;
        }

        let progress = manager.progress(campaign.id).await.unwrap();
        assert_eq!(progress.status, CampaignStatus::Completed);
        assert_eq!((progress.sent, progress.pending, progress.failed), (2, 0, 0));
        assert_eq!(progress.percentage, 100.0);

        let recipients = store.list_recipients(campaign.id).await.unwrap();
        assert_eq!(recipients[0].phone, "6281");
    }
}
