//! Monthly quota accounting shared by every store backend

use crate::models::UserQuota;
use bulkline_common::config::QuotaConfig;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

/// Failure reason recorded on recipients when a quota check denies a send
pub const QUOTA_EXCEEDED_REASON: &str = "quota exceeded";

/// Outcome of a quota check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    /// Units left this month; `None` for unlimited plans
    pub remaining: Option<i64>,
    pub reason: Option<String>,
}

impl QuotaDecision {
    /// Decision used when the gate fails open
    pub fn fail_open() -> Self {
        Self {
            allowed: true,
            remaining: None,
            reason: None,
        }
    }
}

impl UserQuota {
    /// Fresh usage row for a user on `plan`
    pub fn new(user_id: uuid::Uuid, plan: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            plan: plan.into(),
            quota: None,
            used: 0,
            last_reset: now,
        }
    }

    /// Effective monthly cap; `None` means unlimited
    pub fn cap(&self, config: &QuotaConfig) -> Option<i64> {
        match self.quota {
            Some(q) if q != 0 => Some(q),
            _ => config.plan_cap(&self.plan),
        }
    }

    /// Reset usage when `now` is in a different calendar month than the last
    /// reset. Returns true when a reset happened.
    pub fn roll_month(&mut self, now: DateTime<Utc>) -> bool {
        if (self.last_reset.year(), self.last_reset.month()) != (now.year(), now.month()) {
            self.used = 0;
            self.last_reset = now;
            return true;
        }
        false
    }

    /// Check `cost` against the cap and consume it when allowed.
    ///
    /// Mutates the row in place; callers persist it inside the same
    /// transaction that read it.
    pub fn consume(&mut self, cost: i64, now: DateTime<Utc>, config: &QuotaConfig) -> QuotaDecision {
        self.roll_month(now);

        let Some(cap) = self.cap(config) else {
            self.used += cost;
            return QuotaDecision {
                allowed: true,
                remaining: None,
                reason: None,
            };
        };

        if self.used + cost > cap {
            return QuotaDecision {
                allowed: false,
                remaining: Some((cap - self.used).max(0)),
                reason: Some(format!(
                    "{}: {} of {} messages used this month",
                    QUOTA_EXCEEDED_REASON, self.used, cap
                )),
            };
        }

        self.used += cost;
        QuotaDecision {
            allowed: true,
            remaining: Some(cap - self.used),
            reason: None,
        }
    }
}
