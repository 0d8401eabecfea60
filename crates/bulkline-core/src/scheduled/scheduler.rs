//! Campaign scheduler - periodic discovery of due campaigns

use crate::delivery::{DeliveryWorker, ProcessOutcome};
use crate::recurrence;
use bulkline_common::config::SchedulerConfig;
use bulkline_common::types::CampaignId;
use bulkline_storage::{Campaign, CampaignStatus, CampaignStore, RearmRecurring, StoreError};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration as TokioDuration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// What one scheduler pass did
#[derive(Default)]
pub struct TickReport {
    /// Campaigns handed to the delivery worker, with their task handles
    pub triggered: Vec<(CampaignId, JoinHandle<ProcessOutcome>)>,
    /// Recurring campaigns that started a new cycle
    pub rearmed: Vec<CampaignId>,
    /// Recurring campaigns retired because their runs are used up
    pub retired: Vec<CampaignId>,
    /// Campaigns that had stale `sending` recipients reverted
    pub reclaimed: Vec<CampaignId>,
}

impl TickReport {
    pub fn triggered_ids(&self) -> Vec<CampaignId> {
        self.triggered.iter().map(|(id, _)| *id).collect()
    }

    /// Wait for every triggered delivery to finish
    pub async fn join(self) -> Vec<(CampaignId, ProcessOutcome)> {
        let mut outcomes = Vec::with_capacity(self.triggered.len());
        for (id, handle) in self.triggered {
            match handle.await {
                Ok(outcome) => outcomes.push((id, outcome)),
                Err(e) => error!(campaign_id = %id, error = %e, "Delivery task failed"),
            }
        }
        outcomes
    }
}

/// Periodic tick that finds due one-shot and recurring campaigns and hands
/// them to the delivery worker without waiting for delivery.
pub struct Scheduler {
    store: Arc<dyn CampaignStore>,
    worker: Arc<DeliveryWorker>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        worker: Arc<DeliveryWorker>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            worker,
            config,
        }
    }

    /// Tick until `shutdown` flips to true or its sender is dropped
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(TokioDuration::from_secs(self.config.tick_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Campaign scheduler started (interval: {}s, lookahead: {}s)",
            self.config.tick_interval_secs, self.config.lookahead_secs
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick(Utc::now()).await;
                    if !report.triggered.is_empty() {
                        debug!(triggered = report.triggered.len(), "Scheduler tick dispatched campaigns");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Campaign scheduler stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Trigger overdue one-shot campaigns and interrupted runs left behind by
    /// a previous process
    pub async fn recover_on_startup(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let mut seen = HashSet::new();

        match self.store.list_due_one_shot(now).await {
            Ok(due) => {
                if !due.is_empty() {
                    info!(count = due.len(), "Recovering missed one-shot campaigns");
                }
                for campaign in due {
                    self.dispatch(campaign.id, &mut seen, &mut report);
                }
            }
            Err(e) => error!("Error recovering missed campaigns: {}", e),
        }

        if let Err(e) = self.scan_interrupted(now, &mut seen, &mut report).await {
            error!("Error recovering interrupted campaigns: {}", e);
        }

        report
    }

    /// One scheduler pass. Each scan runs even if an earlier one failed.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let mut seen = HashSet::new();

        if let Err(e) = self.scan_one_shot(now, &mut seen, &mut report).await {
            error!("Error scanning one-shot campaigns: {}", e);
        }

        if let Err(e) = self.scan_recurring(now, &mut seen, &mut report).await {
            error!("Error scanning recurring campaigns: {}", e);
        }

        if let Err(e) = self.scan_undelivered(&mut seen, &mut report).await {
            error!("Error scanning undelivered recurring campaigns: {}", e);
        }

        if let Err(e) = self.reclaim_stale(now, &mut seen, &mut report).await {
            error!("Error reclaiming stale recipients: {}", e);
        }

        if let Err(e) = self.scan_interrupted(now, &mut seen, &mut report).await {
            error!("Error scanning interrupted campaigns: {}", e);
        }

        report
    }

    async fn scan_one_shot(
        &self,
        now: DateTime<Utc>,
        seen: &mut HashSet<CampaignId>,
        report: &mut TickReport,
    ) -> Result<(), StoreError> {
        let until = now + Duration::seconds(self.config.lookahead_secs);
        for campaign in self.store.list_due_one_shot(until).await? {
            debug!(
                campaign_id = %campaign.id,
                scheduled_at = ?campaign.scheduled_at,
                "One-shot campaign due"
            );
            self.dispatch(campaign.id, seen, report);
        }
        Ok(())
    }

    async fn scan_recurring(
        &self,
        now: DateTime<Utc>,
        seen: &mut HashSet<CampaignId>,
        report: &mut TickReport,
    ) -> Result<(), StoreError> {
        let guard = Duration::seconds(self.config.refire_guard_secs);

        for campaign in self.store.list_recurring_candidates().await? {
            if !recurrence::should_fire(&campaign, now, guard) {
                continue;
            }

            if campaign.runs_exhausted() {
                if self.store.retire_recurring(campaign.id, now).await? {
                    info!(
                        campaign_id = %campaign.id,
                        run_count = campaign.run_count,
                        "Recurring campaign reached max runs, retired"
                    );
                    report.retired.push(campaign.id);
                }
                continue;
            }

            let Some(next_run_at) = self.next_run_after_fire(&campaign, now) else {
                continue;
            };

            let rearm = RearmRecurring {
                expected_run_count: campaign.run_count,
                fired_at: now,
                next_run_at,
            };
            if !self.store.rearm_recurring(campaign.id, rearm).await? {
                debug!(campaign_id = %campaign.id, "Recurring campaign fired elsewhere");
                continue;
            }

            info!(
                campaign_id = %campaign.id,
                run = campaign.run_count + 1,
                next_run_at = ?next_run_at,
                "Recurring campaign fired"
            );
            report.rearmed.push(campaign.id);
            self.dispatch(campaign.id, seen, report);
        }
        Ok(())
    }

    /// Recurring campaigns that fired but were never delivered, e.g. because
    /// the device was offline at the trigger minute. They stay `scheduled`
    /// with recipients pending until a tick finds the device ready.
    async fn scan_undelivered(
        &self,
        seen: &mut HashSet<CampaignId>,
        report: &mut TickReport,
    ) -> Result<(), StoreError> {
        for campaign in self.store.list_recurring_candidates().await? {
            if campaign.status != CampaignStatus::Scheduled
                || campaign.run_count == 0
                || campaign.last_run_at.is_none()
                || seen.contains(&campaign.id)
            {
                continue;
            }
            if self.store.campaign_progress(campaign.id).await?.pending == 0 {
                continue;
            }

            debug!(
                campaign_id = %campaign.id,
                run = campaign.run_count,
                "Retrying undelivered recurring run"
            );
            self.dispatch(campaign.id, seen, report);
        }
        Ok(())
    }

    /// `next_run_at` to persist when `campaign` fires at `now`: `Some(None)`
    /// for the final permitted run, `None` when the rule cannot be evaluated
    fn next_run_after_fire(
        &self,
        campaign: &Campaign,
        now: DateTime<Utc>,
    ) -> Option<Option<DateTime<Utc>>> {
        if campaign.max_runs == Some(campaign.run_count + 1) {
            return Some(None);
        }

        let rule = campaign.recurrence()?;
        match recurrence::next_run(&rule, &campaign.timezone, now) {
            Ok(next) => Some(Some(next)),
            Err(e) => {
                warn!(campaign_id = %campaign.id, error = %e, "Invalid recurrence, not firing");
                None
            }
        }
    }

    async fn reclaim_stale(
        &self,
        now: DateTime<Utc>,
        seen: &mut HashSet<CampaignId>,
        report: &mut TickReport,
    ) -> Result<(), StoreError> {
        let cutoff = now - Duration::seconds(self.config.reclaim_after_secs);
        let campaigns = self.store.reclaim_stale(cutoff).await?;

        for id in campaigns {
            warn!(campaign_id = %id, "Reverted stale sending recipients to pending");
            report.reclaimed.push(id);
            self.dispatch(id, seen, report);
        }
        Ok(())
    }

    async fn scan_interrupted(
        &self,
        now: DateTime<Utc>,
        seen: &mut HashSet<CampaignId>,
        report: &mut TickReport,
    ) -> Result<(), StoreError> {
        for campaign in self.store.list_interrupted(now).await? {
            debug!(campaign_id = %campaign.id, "Resuming interrupted campaign");
            self.dispatch(campaign.id, seen, report);
        }
        Ok(())
    }

    fn dispatch(&self, id: CampaignId, seen: &mut HashSet<CampaignId>, report: &mut TickReport) {
        if self.worker.tracker().contains(id) || !seen.insert(id) {
            return;
        }
        report.triggered.push((id, self.worker.trigger(id)));
    }
}
