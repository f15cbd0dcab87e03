//! Reconciliation engine: the only writer of chain-derived mirror fields.
//!
//! Entry points:
//!
//! * [`ReconciliationEngine::apply_event`]: idempotent upsert driven by one
//!   decoded log. Redelivered contributions are recognised by transaction hash;
//!   out-of-order ones still land in the contributor ledger but never move
//!   `raised_amount` backwards.
//! * [`ReconciliationEngine::resync`]: unconditional overwrite from a live
//!   chain snapshot. A snapshot lower than the mirror is recorded as a drift
//!   correction.
//! * [`ReconciliationEngine::finalize_if_ended`]: one-shot flip of a campaign
//!   whose deadline has passed.
//!
//! Mutations for one campaign are serialised through a per-address async lock;
//! different campaigns proceed concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use alloy_primitives::Address;
use sqlx::SqlitePool;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::chain::{ChainReader, ContractMethod};
use crate::db::{self, ContributionWrite};
use crate::errors::{Result, SyncError};
use crate::events::{canonical, unix_now, CampaignCreatedEvent, CampaignRecord, DomainEvent};

/// What applying one event did to the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    AlreadyMirrored,
    ContributionApplied {
        new_contributor: bool,
        raised_advanced: bool,
    },
    /// Same transaction already applied; nothing changed.
    Duplicate,
    /// Contribution log from a contract the factory never created.
    ForeignCampaign,
}

/// One async mutex per campaign address.
#[derive(Default)]
pub struct CampaignLocks {
    inner: Mutex<HashMap<Address, Arc<tokio::sync::Mutex<()>>>>,
}

impl CampaignLocks {
    pub async fn lock(&self, address: Address) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(address).or_default().clone()
        };
        lock.lock_owned().await
    }
}

pub struct ReconciliationEngine<R: ChainReader> {
    pool: SqlitePool,
    reader: Arc<R>,
    locks: CampaignLocks,
}

impl<R: ChainReader> ReconciliationEngine<R> {
    pub fn new(pool: SqlitePool, reader: Arc<R>) -> Self {
        Self {
            pool,
            reader,
            locks: CampaignLocks::default(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn reader(&self) -> &Arc<R> {
        &self.reader
    }

    /// Apply one decoded event. Safe to call any number of times for the same event.
    pub async fn apply_event(&self, event: &DomainEvent) -> Result<ApplyOutcome> {
        let address = event.campaign_address();
        let _guard = self.locks.lock(address).await;

        match event {
            DomainEvent::CampaignCreated(created) => self.create_locked(created).await,
            DomainEvent::ContributionReceived(ev) => {
                if !self.ensure_mirrored_locked(address).await? {
                    debug!(campaign = %canonical(&address), "Ignoring contribution to foreign contract");
                    return Ok(ApplyOutcome::ForeignCampaign);
                }

                match db::increment_contributor(&self.pool, ev, unix_now()).await? {
                    ContributionWrite::Duplicate => {
                        debug!(
                            campaign = %canonical(&address),
                            tx = %ev.transaction_hash,
                            "Duplicate contribution delivery ignored"
                        );
                        Ok(ApplyOutcome::Duplicate)
                    }
                    ContributionWrite::Applied {
                        new_contributor,
                        raised_advanced,
                    } => {
                        if !raised_advanced {
                            debug!(
                                campaign = %canonical(&address),
                                block = ev.block_number,
                                log_index = ev.log_index,
                                total_raised = %ev.total_raised,
                                "Stale event: contribution recorded, raised amount unchanged"
                            );
                        }
                        info!(
                            campaign = %canonical(&address),
                            contributor = %canonical(&ev.contributor),
                            amount = %ev.amount,
                            "Contribution recorded"
                        );
                        Ok(ApplyOutcome::ContributionApplied {
                            new_contributor,
                            raised_advanced,
                        })
                    }
                }
            }
        }
    }

    /// Overwrite chain-synced fields from live reads, creating the mirror first
    /// if the address has never been seen.
    pub async fn resync(&self, address: Address) -> Result<CampaignRecord> {
        let key = canonical(&address);
        let _guard = self.locks.lock(address).await;

        if !self.ensure_mirrored_locked(address).await? {
            return Err(SyncError::NotFound(key));
        }
        let current = db::find_campaign_by_address(&self.pool, &key)
            .await?
            .ok_or_else(|| SyncError::NotFound(key.clone()))?;

        let snapshot = self.reader.snapshot(address).await?;
        let mirrored = current.raised()?;

        let drift_from = if snapshot.raised_amount < mirrored {
            warn!(
                campaign = %key,
                mirrored = %mirrored,
                chain = %snapshot.raised_amount,
                block = snapshot.block_number,
                "Drift correction: lowering raised amount to on-chain value"
            );
            Some(mirrored)
        } else {
            if snapshot.raised_amount > mirrored {
                info!(
                    campaign = %key,
                    mirrored = %mirrored,
                    chain = %snapshot.raised_amount,
                    "Resync caught up missed contributions"
                );
            }
            None
        };

        db::set_financials(&self.pool, &key, &snapshot, drift_from, unix_now()).await?;
        info!(campaign = %key, block = snapshot.block_number, "Campaign resynced");

        db::find_campaign_by_address(&self.pool, &key)
            .await?
            .ok_or(SyncError::NotFound(key))
    }

    /// Settle a campaign whose deadline has passed. Returns the finalized row
    /// only for the call that performed the transition.
    pub async fn finalize_if_ended(&self, address: Address, now: i64) -> Result<Option<CampaignRecord>> {
        let key = canonical(&address);
        let _guard = self.locks.lock(address).await;

        let row = db::find_campaign_by_address(&self.pool, &key)
            .await?
            .ok_or_else(|| SyncError::NotFound(key.clone()))?;
        if !row.is_active || row.finalized_at.is_some() || row.deadline > now {
            return Ok(None);
        }

        let raised = row.raised()?;
        let goal = row.goal()?;
        let successful = raised >= goal;
        if !db::finalize_campaign(&self.pool, &key, successful, now).await? {
            return Ok(None);
        }
        info!(
            campaign = %key,
            raised = %raised,
            goal = %goal,
            successful,
            "Campaign finalized at deadline"
        );

        db::find_campaign_by_address(&self.pool, &key).await
    }

    async fn create_locked(&self, created: &CampaignCreatedEvent) -> Result<ApplyOutcome> {
        let key = canonical(&created.campaign_address);
        if db::find_campaign_by_address(&self.pool, &key).await?.is_some() {
            debug!(campaign = %key, "Campaign already mirrored");
            return Ok(ApplyOutcome::AlreadyMirrored);
        }

        let details = self.reader.details(created.campaign_address).await?;
        if db::upsert_campaign(&self.pool, created, &details, unix_now()).await? {
            info!(
                campaign = %key,
                campaign_id = created.campaign_id,
                goal = %created.goal_amount,
                "Campaign mirrored"
            );
            Ok(ApplyOutcome::Created)
        } else {
            Ok(ApplyOutcome::AlreadyMirrored)
        }
    }

    /// `true` once a mirror row exists, creating it from the factory's log if needed.
    async fn ensure_mirrored_locked(&self, address: Address) -> Result<bool> {
        let key = canonical(&address);
        if db::find_campaign_by_address(&self.pool, &key).await?.is_some() {
            return Ok(true);
        }
        // One cheap call rules out accounts and unrelated contracts before
        // any log lookup.
        match self.reader.text(address, ContractMethod::Title).await {
            Ok(_) => {}
            Err(e) if e.is_transient() => return Err(e.into()),
            Err(e) => {
                debug!(campaign = %key, "Address does not answer the campaign ABI: {e}");
                return Ok(false);
            }
        }
        match self.reader.find_creation(address).await? {
            Some(created) => {
                info!(campaign = %key, "Lazily mirroring campaign from factory log");
                self.create_locked(&created).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
