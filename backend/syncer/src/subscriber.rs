//! Long-running log subscription: a producer that polls `eth_getLogs` from the
//! persisted cursor and pushes ordered batches onto a bounded channel, and a
//! consumer that applies each batch through the reconciliation engine before
//! advancing the cursor.
//!
//! Delivery is at-least-once. After a transport error the producer rewinds to
//! the persisted cursor, and a batch that fails to apply is retried whole.
//! Both are safe because every engine operation is idempotent.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256};
use alloy_sol_types::SolEvent;
use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::abi::{ICampaign, ICrowdfundingFactory};
use crate::chain::{ChainReader, ReadResult};
use crate::db;
use crate::engine::{ApplyOutcome, ReconciliationEngine};
use crate::errors::Result;
use crate::events::{canonical, parse_address, unix_now, DomainEvent};
use crate::rpc::{decode_logs, LogFilter, RawLog, RpcClient};

/// Keeps `eth_getLogs` address lists within common provider limits.
const MAX_ADDRESSES_PER_FILTER: usize = 200;
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// Transport the subscriber reads logs from.
#[async_trait]
pub trait LogSource: Send + Sync + 'static {
    async fn block_number(&self) -> ReadResult<u64>;
    async fn block_hash(&self, number: u64) -> ReadResult<Option<B256>>;
    async fn get_logs(&self, filter: &LogFilter) -> ReadResult<Vec<RawLog>>;
}

#[async_trait]
impl LogSource for RpcClient {
    async fn block_number(&self) -> ReadResult<u64> {
        RpcClient::block_number(self).await
    }

    async fn block_hash(&self, number: u64) -> ReadResult<Option<B256>> {
        RpcClient::block_hash(self, number).await
    }

    async fn get_logs(&self, filter: &LogFilter) -> ReadResult<Vec<RawLog>> {
        RpcClient::get_logs(self, filter).await
    }
}

/// Cursor row key for a factory's log stream.
pub fn cursor_source(factory: &Address) -> String {
    format!("logs:{}", canonical(factory))
}

/// Events from one block window, sorted by `(block_number, log_index)`.
#[derive(Debug, Clone)]
pub struct EventBatch {
    pub events: Vec<DomainEvent>,
    pub through_block: u64,
    pub through_hash: Option<B256>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Position {
    next_block: u64,
    /// Last consumed block and its hash, for reorg detection.
    anchor: Option<(u64, B256)>,
    /// Every campaign the producer has seen created, applied or not. Windows
    /// are fetched ahead of the consumer, so the store alone lags behind.
    known: HashSet<Address>,
}

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub factory: Address,
    pub start_block: u64,
    pub confirmations: u64,
    pub page_blocks: u64,
    pub poll_interval: Duration,
}

pub struct EventSubscriber<S: LogSource> {
    source: Arc<S>,
    pool: SqlitePool,
    config: SubscriberConfig,
    cursor_key: String,
}

impl<S: LogSource> EventSubscriber<S> {
    pub fn new(source: Arc<S>, pool: SqlitePool, config: SubscriberConfig) -> Self {
        let cursor_key = cursor_source(&config.factory);
        Self {
            source,
            pool,
            config,
            cursor_key,
        }
    }

    pub fn cursor_key(&self) -> &str {
        &self.cursor_key
    }

    /// Poll until cancelled or the consumer goes away.
    pub async fn run(self, tx: mpsc::Sender<EventBatch>, cancel: CancellationToken) {
        info!(
            factory = %canonical(&self.config.factory),
            "Event subscriber starting"
        );

        let mut position = match self.resume_or_wait(&cancel).await {
            Some(p) => p,
            None => return,
        };
        info!("Resuming from block {}", position.next_block);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let caught_up = match self.poll_once(&mut position).await {
                Ok(Some((batch, safe_tip))) => {
                    let through = batch.through_block;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = tx.send(batch) => {
                            if sent.is_err() {
                                warn!("Event consumer closed; stopping subscriber");
                                break;
                            }
                        }
                    }
                    through >= safe_tip
                }
                Ok(None) => true,
                Err(e) => {
                    error!("Subscriber poll error: {e}");
                    // Resume from what is durable, not from what was enqueued.
                    match self.resume_or_wait(&cancel).await {
                        Some(p) => position = p,
                        None => break,
                    }
                    true
                }
            };

            if caught_up {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!("Event subscriber stopped");
    }

    async fn resume_or_wait(&self, cancel: &CancellationToken) -> Option<Position> {
        loop {
            match self.resume_position().await {
                Ok(p) => return Some(p),
                Err(e) => {
                    error!("Cannot read sync cursor: {e}");
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
    }

    async fn resume_position(&self) -> Result<Position> {
        let cursor = db::get_cursor(&self.pool, &self.cursor_key).await?;
        let known = self.mirrored_campaigns().await?;
        Ok(match cursor {
            Some(c) => {
                let block = c.block_number.max(0) as u64;
                let anchor = c
                    .block_hash
                    .as_deref()
                    .and_then(|h| B256::from_str(h).ok())
                    .map(|h| (block, h));
                Position {
                    next_block: block + 1,
                    anchor,
                    known,
                }
            }
            None => Position {
                next_block: self.config.start_block,
                anchor: None,
                known,
            },
        })
    }

    async fn mirrored_campaigns(&self) -> Result<HashSet<Address>> {
        Ok(db::all_campaign_addresses(&self.pool)
            .await?
            .iter()
            .filter_map(|a| parse_address(a).ok())
            .collect())
    }

    /// Fetch the next confirmed window. Returns the batch and the safe tip it was cut against.
    async fn poll_once(&self, pos: &mut Position) -> Result<Option<(EventBatch, u64)>> {
        let tip = self.source.block_number().await?;
        let safe_tip = tip.saturating_sub(self.config.confirmations);

        if let Some((block, hash)) = pos.anchor {
            let current = self.source.block_hash(block).await?;
            if current != Some(hash) {
                let rewind = block
                    .saturating_sub(self.config.confirmations.max(1))
                    .max(self.config.start_block);
                warn!(
                    block,
                    expected = %hash,
                    found = ?current,
                    "Reorg detected at cursor; replaying from block {rewind}"
                );
                pos.next_block = rewind;
                pos.anchor = None;
            }
        }

        if pos.next_block > safe_tip {
            return Ok(None);
        }
        let from = pos.next_block;
        let to = from
            .saturating_add(self.config.page_blocks.max(1) - 1)
            .min(safe_tip);

        let created = self
            .source
            .get_logs(&LogFilter {
                from_block: from,
                to_block: to,
                addresses: vec![self.config.factory],
                topics: vec![Some(vec![ICrowdfundingFactory::CampaignCreated::SIGNATURE_HASH])],
            })
            .await?;
        let mut events = decode_logs(&created, self.config.factory);

        // Campaigns mirrored on demand since the last poll are picked up from the store.
        let mirrored = self.mirrored_campaigns().await?;
        pos.known.extend(mirrored);
        pos.known.extend(events.iter().map(DomainEvent::campaign_address));
        let mut campaigns: Vec<Address> = pos.known.iter().copied().collect();
        campaigns.sort();

        for chunk in campaigns.chunks(MAX_ADDRESSES_PER_FILTER) {
            let logs = self
                .source
                .get_logs(&LogFilter {
                    from_block: from,
                    to_block: to,
                    addresses: chunk.to_vec(),
                    topics: vec![Some(vec![ICampaign::ContributionReceived::SIGNATURE_HASH])],
                })
                .await?;
            events.extend(decode_logs(&logs, self.config.factory));
        }

        events.sort_by_key(DomainEvent::position);
        events.dedup();

        let through_hash = self.source.block_hash(to).await?;
        pos.next_block = to + 1;
        pos.anchor = through_hash.map(|h| (to, h));

        debug!(from, to, events = events.len(), "Log window fetched");
        Ok(Some((
            EventBatch {
                events,
                through_block: to,
                through_hash,
            },
            safe_tip,
        )))
    }
}

// ─────────────────────────────────────────────────────────
// Consumer
// ─────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    pub created: usize,
    pub contributions: usize,
    pub duplicates: usize,
    pub stale: usize,
    pub skipped: usize,
}

impl BatchStats {
    fn record(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Created => self.created += 1,
            ApplyOutcome::AlreadyMirrored | ApplyOutcome::Duplicate => self.duplicates += 1,
            ApplyOutcome::ContributionApplied {
                raised_advanced, ..
            } => {
                self.contributions += 1;
                if !raised_advanced {
                    self.stale += 1;
                }
            }
            ApplyOutcome::ForeignCampaign => self.skipped += 1,
        }
    }
}

/// Apply every event in order, then persist the cursor. Transient failures
/// abort before the cursor moves; permanent per-event failures are logged and
/// the event skipped.
pub async fn apply_batch<R: ChainReader>(
    engine: &ReconciliationEngine<R>,
    batch: &EventBatch,
    cursor_key: &str,
) -> Result<BatchStats> {
    let mut stats = BatchStats::default();

    for event in &batch.events {
        match engine.apply_event(event).await {
            Ok(outcome) => stats.record(outcome),
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                warn!(
                    kind = event.kind(),
                    campaign = %canonical(&event.campaign_address()),
                    block = event.position().block_number,
                    "Skipping event: {e}"
                );
                stats.skipped += 1;
            }
        }
    }

    let hash = batch.through_hash.map(|h| format!("0x{}", hex::encode(h)));
    db::save_cursor(
        engine.pool(),
        cursor_key,
        batch.through_block as i64,
        hash.as_deref(),
        unix_now(),
    )
    .await?;
    Ok(stats)
}

/// Drain batches until cancelled. A batch in progress is always finished (or
/// left with the cursor untouched) before returning.
pub async fn consume<R: ChainReader>(
    engine: Arc<ReconciliationEngine<R>>,
    mut rx: mpsc::Receiver<EventBatch>,
    cursor_key: String,
    retry_backoff: Duration,
    cancel: CancellationToken,
) {
    loop {
        let batch = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(batch) => batch,
                None => break,
            },
        };

        let mut backoff = retry_backoff;
        loop {
            match apply_batch(&engine, &batch, &cursor_key).await {
                Ok(stats) => {
                    if batch.events.is_empty() {
                        debug!(block = batch.through_block, "Cursor advanced");
                    } else {
                        info!(
                            block = batch.through_block,
                            created = stats.created,
                            contributions = stats.contributions,
                            duplicates = stats.duplicates,
                            stale = stats.stale,
                            skipped = stats.skipped,
                            "Applied {} events",
                            batch.events.len()
                        );
                    }
                    break;
                }
                Err(e) => {
                    warn!(
                        block = batch.through_block,
                        "Batch not applied, cursor held (retry in {backoff:?}): {e}"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("Shutdown with batch pending; it will be replayed on restart");
                            return;
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
                }
            }
        }
    }

    info!("Event consumer stopped");
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
