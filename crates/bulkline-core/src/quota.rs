//! Quota gate - monthly allowance check in front of every send

use bulkline_common::config::QuotaConfig;
use bulkline_common::types::UserId;
use bulkline_storage::{QuotaDecision, QuotaStore, StoreError, UserQuota};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Usage summary for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub user_id: UserId,
    pub plan: String,
    /// `None` for unlimited plans
    pub cap: Option<i64>,
    pub used: i64,
    pub remaining: Option<i64>,
}

/// Atomic check-and-increment of per-user monthly usage
pub struct QuotaGate {
    store: Arc<dyn QuotaStore>,
    config: QuotaConfig,
}

impl QuotaGate {
    pub fn new(store: Arc<dyn QuotaStore>, config: QuotaConfig) -> Self {
        Self { store, config }
    }

    /// Consume `cost` units for `user_id`.
    ///
    /// Serialization conflicts are retried up to the configured limit. Any
    /// other failure, or running out of retries, allows the send.
    pub async fn check_and_increment(&self, user_id: UserId, cost: i64) -> QuotaDecision {
        let attempts = self.config.max_retries.max(1);

        for attempt in 1..=attempts {
            match self
                .store
                .consume_quota(user_id, cost, Utc::now(), &self.config)
                .await
            {
                Ok(decision) => {
                    debug!(
                        user_id = %user_id,
                        cost,
                        allowed = decision.allowed,
                        remaining = ?decision.remaining,
                        "Quota checked"
                    );
                    return decision;
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    debug!(user_id = %user_id, attempt, "Quota transaction conflict, retrying");
                }
                Err(StoreError::Serialization) => {
                    warn!(
                        user_id = %user_id,
                        attempts,
                        "Quota transaction kept conflicting, allowing send"
                    );
                    return QuotaDecision::fail_open();
                }
                Err(e) => {
                    error!(user_id = %user_id, error = %e, "Quota check failed, allowing send");
                    return QuotaDecision::fail_open();
                }
            }
        }

        QuotaDecision::fail_open()
    }

    /// Current usage for `user_id`; users without a row report the default
    /// plan with nothing used
    pub async fn usage(&self, user_id: UserId) -> Result<QuotaUsage, StoreError> {
        let mut row = self
            .store
            .get_quota(user_id)
            .await?
            .unwrap_or_else(|| UserQuota::new(user_id, self.config.default_plan.clone(), Utc::now()));
        row.roll_month(Utc::now());

        let cap = row.cap(&self.config);
        Ok(QuotaUsage {
            user_id,
            plan: row.plan,
            cap,
            used: row.used,
            remaining: cap.map(|c| (c - row.used).max(0)),
        })
    }

    /// Assign a plan, with an optional explicit monthly cap
    pub async fn set_plan(
        &self,
        user_id: UserId,
        plan: &str,
        quota: Option<i64>,
    ) -> Result<QuotaUsage, StoreError> {
        self.store.set_plan(user_id, plan, quota, Utc::now()).await?;
        self.usage(user_id).await
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }
}
