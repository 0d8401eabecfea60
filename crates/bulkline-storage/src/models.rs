//! Campaign data model

use bulkline_common::types::{CampaignId, DeviceId, MediaKind, RecipientId, TimeOfDay, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Campaign status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Scheduled,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl CampaignStatus {
    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// `Completed -> Scheduled` is the recurring re-arm and
    /// `Scheduled -> Completed` retires a recurring campaign whose runs are
    /// exhausted before it fires again.
    pub fn can_transition_to(self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (Scheduled, Running)
                | (Scheduled, Paused)
                | (Scheduled, Cancelled)
                | (Scheduled, Completed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Paused)
                | (Paused, Scheduled)
                | (Paused, Cancelled)
                | (Completed, Scheduled)
                | (Completed, Completed)
        )
    }

    /// Statuses the delivery worker never acts on
    pub fn is_idle(self) -> bool {
        matches!(
            self,
            CampaignStatus::Completed
                | CampaignStatus::Failed
                | CampaignStatus::Cancelled
                | CampaignStatus::Paused
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Running => "running",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Failed => "failed",
            CampaignStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "running" => Ok(CampaignStatus::Running),
            "paused" => Ok(CampaignStatus::Paused),
            "completed" => Ok(CampaignStatus::Completed),
            "failed" => Ok(CampaignStatus::Failed),
            "cancelled" => Ok(CampaignStatus::Cancelled),
            _ => Err(format!("Invalid campaign status: {}", s)),
        }
    }
}

/// Recipient delivery status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Pending,
    Sending,
    Sent,
    Failed,
}

impl RecipientStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecipientStatus::Pending => "pending",
            RecipientStatus::Sending => "sending",
            RecipientStatus::Sent => "sent",
            RecipientStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RecipientStatus::Sent | RecipientStatus::Failed)
    }
}

impl std::fmt::Display for RecipientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecipientStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecipientStatus::Pending),
            "sending" => Ok(RecipientStatus::Sending),
            "sent" => Ok(RecipientStatus::Sent),
            "failed" => Ok(RecipientStatus::Failed),
            _ => Err(format!("Invalid recipient status: {}", s)),
        }
    }
}

/// Recurrence period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurringType {
    Daily,
    Weekly,
    Monthly,
}

impl RecurringType {
    pub fn as_str(self) -> &'static str {
        match self {
            RecurringType::Daily => "daily",
            RecurringType::Weekly => "weekly",
            RecurringType::Monthly => "monthly",
        }
    }
}

impl std::fmt::Display for RecurringType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecurringType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(RecurringType::Daily),
            "weekly" => Ok(RecurringType::Weekly),
            "monthly" => Ok(RecurringType::Monthly),
            _ => Err(format!("Invalid recurring type: {}", s)),
        }
    }
}

/// When a recurring campaign fires.
///
/// `days` holds weekdays (0 = Sunday .. 6 = Saturday) for weekly rules and
/// days of the month (1..=31) for monthly rules; daily rules ignore it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub kind: RecurringType,
    #[serde(default)]
    pub days: Vec<i32>,
    pub time: TimeOfDay,
}

/// Campaign model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub owner_user_id: Option<UserId>,
    pub device_id: DeviceId,
    pub name: String,
    pub message: String,
    pub media_url: Option<String>,
    pub total_recipients: i32,
    pub sent_count: i32,
    pub failed_count: i32,
    pub status: CampaignStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub timezone: String,
    pub is_recurring: bool,
    pub recurring_type: Option<RecurringType>,
    pub recurring_days: Vec<i32>,
    pub recurring_time: Option<TimeOfDay>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub run_count: i32,
    pub max_runs: Option<i32>,
    pub priority: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// Recurrence rule, present only for recurring campaigns
    pub fn recurrence(&self) -> Option<RecurrenceRule> {
        if !self.is_recurring {
            return None;
        }
        Some(RecurrenceRule {
            kind: self.recurring_type?,
            days: self.recurring_days.clone(),
            time: self.recurring_time?,
        })
    }

    /// Whether the campaign has used up its permitted runs
    pub fn runs_exhausted(&self) -> bool {
        matches!(self.max_runs, Some(max) if self.run_count >= max)
    }

    /// Media kind of the attachment, if any
    pub fn media_kind(&self) -> Option<MediaKind> {
        self.media_url.as_deref().map(MediaKind::from_url)
    }

    /// Quota units one recipient costs: text and attachment count separately
    pub fn send_cost(&self) -> i64 {
        if self.media_url.is_some() && !self.message.trim().is_empty() {
            2
        } else {
            1
        }
    }

    /// Progress percentage
    pub fn progress_percentage(&self) -> f64 {
        if self.total_recipients == 0 {
            return 0.0;
        }
        ((self.sent_count + self.failed_count) as f64 / self.total_recipients as f64) * 100.0
    }
}

/// Recipient model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub id: RecipientId,
    pub campaign_id: CampaignId,
    pub phone: String,
    pub name: Option<String>,
    pub status: RecipientStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Logical send endpoint registered on the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: DeviceId,
    pub owner_user_id: Option<UserId>,
    pub name: Option<String>,
}

/// Append-only record of one successful send
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageLog {
    pub id: Uuid,
    pub campaign_id: CampaignId,
    pub recipient_id: RecipientId,
    pub device_id: DeviceId,
    pub owner_user_id: Option<UserId>,
    pub phone: String,
    pub provider_message_id: String,
    pub media_kind: Option<MediaKind>,
    pub created_at: DateTime<Utc>,
}

/// Input for a message log record
#[derive(Debug, Clone)]
pub struct NewMessageLog {
    pub device_id: DeviceId,
    pub owner_user_id: Option<UserId>,
    pub phone: String,
    pub provider_message_id: String,
    pub media_kind: Option<MediaKind>,
}

/// Per-user monthly usage row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserQuota {
    pub user_id: UserId,
    pub plan: String,
    /// Explicit monthly cap; `None` or 0 falls back to the plan default
    pub quota: Option<i64>,
    pub used: i64,
    pub last_reset: DateTime<Utc>,
}

/// Create recipient input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRecipient {
    pub phone: String,
    pub name: Option<String>,
}

/// Create campaign input
#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub owner_user_id: Option<UserId>,
    pub device_id: DeviceId,
    pub name: String,
    pub message: String,
    pub media_url: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub timezone: String,
    pub recurrence: Option<RecurrenceRule>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub max_runs: Option<i32>,
    pub priority: i32,
    pub recipients: Vec<NewRecipient>,
}

/// Recurrence parameters written by the control surface
#[derive(Debug, Clone)]
pub struct RecurringUpdate {
    pub rule: RecurrenceRule,
    pub timezone: String,
    pub max_runs: Option<i32>,
    pub next_run_at: DateTime<Utc>,
}

/// Values written when a recurring campaign fires a new cycle
#[derive(Debug, Clone, Copy)]
pub struct RearmRecurring {
    /// `run_count` observed when the fire was decided
    pub expected_run_count: i32,
    pub fired_at: DateTime<Utc>,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Recipient counts by status for one campaign
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignProgress {
    pub pending: i64,
    pub sending: i64,
    pub sent: i64,
    pub failed: i64,
}

impl CampaignProgress {
    pub fn total(&self) -> i64 {
        self.pending + self.sending + self.sent + self.failed
    }

    /// Recipients still waiting for a terminal outcome
    pub fn outstanding(&self) -> i64 {
        self.pending + self.sending
    }
}
