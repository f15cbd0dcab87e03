//! Periodic reconciliation passes over the whole working set.
//!
//! * Resync sweep: every active campaign is resynced from live chain reads,
//!   one at a time with a pacing delay between RPC-heavy calls.
//! * Deadline sweep: campaigns past their deadline are settled once, and a
//!   notification is spawned for each one that reached its goal.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::chain::ChainReader;
use crate::db;
use crate::engine::ReconciliationEngine;
use crate::errors::Result;
use crate::events::{parse_address, unix_now};
use crate::notify::{CampaignSucceeded, Notifier};

#[derive(Debug, Clone, Copy)]
pub struct ScheduleConfig {
    pub resync_interval: Duration,
    pub resync_pacing: Duration,
    pub deadline_interval: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResyncReport {
    pub attempted: usize,
    pub failed: usize,
    /// Cancelled before every campaign was visited.
    pub interrupted: bool,
}

#[derive(Debug, Default)]
pub struct DeadlineReport {
    pub finalized: usize,
    pub successful: usize,
    pub failed: usize,
    /// Detached notification tasks; the loop drops them, tests await them.
    pub notifications: Vec<JoinHandle<()>>,
}

pub struct Scheduler<R: ChainReader> {
    engine: Arc<ReconciliationEngine<R>>,
    notifier: Arc<dyn Notifier>,
    config: ScheduleConfig,
}

impl<R: ChainReader> Scheduler<R> {
    pub fn new(
        engine: Arc<ReconciliationEngine<R>>,
        notifier: Arc<dyn Notifier>,
        config: ScheduleConfig,
    ) -> Self {
        Self {
            engine,
            notifier,
            config,
        }
    }

    /// Resync every active campaign. One failure never stops the sweep.
    pub async fn resync_sweep(&self, cancel: &CancellationToken) -> Result<ResyncReport> {
        let addresses = db::active_campaign_addresses(self.engine.pool()).await?;
        let mut report = ResyncReport::default();

        for (i, raw) in addresses.iter().enumerate() {
            if cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            if i > 0 && !self.config.resync_pacing.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        report.interrupted = true;
                        break;
                    }
                    _ = tokio::time::sleep(self.config.resync_pacing) => {}
                }
            }

            report.attempted += 1;
            let result = match parse_address(raw) {
                Ok(address) => self.engine.resync(address).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                report.failed += 1;
                warn!(campaign = %raw, "Resync failed, continuing sweep: {e}");
            }
        }

        info!(
            campaigns = addresses.len(),
            attempted = report.attempted,
            failed = report.failed,
            interrupted = report.interrupted,
            "Resync sweep finished"
        );
        Ok(report)
    }

    /// Settle every campaign whose deadline is at or before `now`.
    pub async fn deadline_sweep(&self, now: i64) -> Result<DeadlineReport> {
        let due = db::campaigns_past_deadline(self.engine.pool(), now).await?;
        let mut report = DeadlineReport::default();

        for row in due {
            let finalized = match parse_address(&row.contract_address) {
                Ok(address) => self.engine.finalize_if_ended(address, now).await,
                Err(e) => Err(e),
            };
            let finalized = match finalized {
                Ok(Some(f)) => f,
                Ok(None) => continue,
                Err(e) => {
                    report.failed += 1;
                    error!(campaign = %row.contract_address, "Deadline finalization failed: {e}");
                    continue;
                }
            };

            report.finalized += 1;
            if !finalized.is_successful {
                continue;
            }
            report.successful += 1;

            let notice = CampaignSucceeded {
                campaign_address: finalized.contract_address.clone(),
                recipient: finalized.creator.clone(),
                campaign_title: finalized.title.clone(),
                total_raised: finalized.raised_amount.clone(),
            };
            let notifier = self.notifier.clone();
            report.notifications.push(tokio::spawn(async move {
                if let Err(e) = notifier.campaign_succeeded(&notice).await {
                    warn!(campaign = %notice.campaign_address, "Notification failed: {e}");
                }
            }));
        }

        if report.finalized > 0 || report.failed > 0 {
            info!(
                finalized = report.finalized,
                successful = report.successful,
                failed = report.failed,
                "Deadline sweep finished"
            );
        }
        Ok(report)
    }

    pub async fn run_resync_loop(self: Arc<Self>, cancel: CancellationToken) {
        info!(every = ?self.config.resync_interval, "Resync sweep scheduled");
        let mut ticker = tokio::time::interval(self.config.resync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.resync_sweep(&cancel).await {
                        error!("Resync sweep aborted: {e}");
                    }
                }
            }
        }
        info!("Resync sweep stopped");
    }

    pub async fn run_deadline_loop(self: Arc<Self>, cancel: CancellationToken) {
        info!(every = ?self.config.deadline_interval, "Deadline sweep scheduled");
        let mut ticker = tokio::time::interval(self.config.deadline_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.deadline_sweep(unix_now()).await {
                        error!("Deadline sweep aborted: {e}");
                    }
                }
            }
        }
        info!("Deadline sweep stopped");
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
