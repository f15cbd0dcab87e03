//! Database layer: migrations, mirror reads/writes and cursor management.
//!
//! Every chain-derived write happens inside a single transaction per
//! campaign, so readers never observe a contributor added without the
//! matching count or total.

use std::str::FromStr;

use alloy_primitives::U256;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::info;

use crate::chain::{CampaignDetails, ChainSnapshot};
use crate::errors::{Result, SyncError};
use crate::events::{
    canonical, parse_amount, CampaignCreatedEvent, CampaignRecord, ContributionReceivedEvent,
    ContributionRecord, LocalFieldsUpdate, LogPosition,
};

const CAMPAIGN_COLUMNS: &str = r#"
    contract_address, campaign_id, creator, title, description, category, tags,
    image_url, video_url, goal_amount, raised_amount, deadline, is_active,
    is_successful, contributor_count, financials_block, financials_log_index,
    snapshot_block, last_synced_at, finalized_at, views, shares, is_featured,
    is_verified, created_at, updated_at
"#;

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Cursor helpers
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SyncCursor {
    pub block_number: i64,
    pub block_hash: Option<String>,
}

/// Read the last fully applied block for `source`.
pub async fn get_cursor(pool: &SqlitePool, source: &str) -> Result<Option<SyncCursor>> {
    let row = sqlx::query_as::<_, SyncCursor>(
        "SELECT block_number, block_hash FROM sync_cursors WHERE source = ?1",
    )
    .bind(source)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Persist the cursor. Only called once everything up to `block_number` is durable.
pub async fn save_cursor(
    pool: &SqlitePool,
    source: &str,
    block_number: i64,
    block_hash: Option<&str>,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_cursors (source, block_number, block_hash, updated_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT (source) DO UPDATE SET
            block_number = excluded.block_number,
            block_hash   = excluded.block_hash,
            updated_at   = excluded.updated_at
        "#,
    )
    .bind(source)
    .bind(block_number)
    .bind(block_hash)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Campaign writes (reconciliation engine only)
// ─────────────────────────────────────────────────────────

/// Insert a new mirror row from its creation event. Returns `false` if the
/// address is already mirrored.
pub async fn upsert_campaign(
    pool: &SqlitePool,
    created: &CampaignCreatedEvent,
    details: &CampaignDetails,
    now: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        INSERT OR IGNORE INTO campaigns
            (contract_address, campaign_id, creator, title, description, image_url,
             goal_amount, raised_amount, deadline, is_active, is_successful,
             contributor_count, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '0', ?8, 1, 0, 0, ?9, ?9)
        "#,
    )
    .bind(canonical(&created.campaign_address))
    .bind(created.campaign_id as i64)
    .bind(canonical(&created.creator))
    .bind(&details.title)
    .bind(&details.description)
    .bind(&details.image_url)
    .bind(created.goal_amount.to_string())
    .bind(created.deadline as i64)
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

/// Result of recording one contribution event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContributionWrite {
    /// The transaction hash was already applied to this campaign.
    Duplicate,
    Applied {
        new_contributor: bool,
        /// `false` when the event was stale relative to the mirrored financials.
        raised_advanced: bool,
    },
}

/// Record a contribution atomically: receipt, contributor running total,
/// contributor count and (when newer) the campaign's `raised_amount`.
pub async fn increment_contributor(
    pool: &SqlitePool,
    ev: &ContributionReceivedEvent,
    now: i64,
) -> Result<ContributionWrite> {
    let campaign = canonical(&ev.campaign_address);
    let contributor = canonical(&ev.contributor);
    let tx_hash = format!("0x{}", hex::encode(ev.transaction_hash));
    let block = ev.block_number as i64;
    let log_index = ev.log_index as i64;
    let position = LogPosition::new(ev.block_number, ev.log_index);
    let timestamp = ev.block_timestamp.unwrap_or(now);

    let mut tx = pool.begin().await?;

    // Write first so the transaction holds the write lock from the start.
    let receipt = sqlx::query(
        r#"
        INSERT OR IGNORE INTO contribution_receipts
            (campaign_address, transaction_hash, contributor, amount, block_number, log_index, applied_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&campaign)
    .bind(&tx_hash)
    .bind(&contributor)
    .bind(ev.amount.to_string())
    .bind(block)
    .bind(log_index)
    .bind(now)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if receipt == 0 {
        tx.rollback().await?;
        return Ok(ContributionWrite::Duplicate);
    }

    let (raised, fin_block, fin_log, snapshot_block): (String, i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT raised_amount, financials_block, financials_log_index, snapshot_block
        FROM   campaigns WHERE contract_address = ?1
        "#,
    )
    .bind(&campaign)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| SyncError::NotFound(campaign.clone()))?;

    let existing: Option<(String, i64, i64)> = sqlx::query_as(
        r#"
        SELECT amount, last_block, last_log_index FROM contributions
        WHERE  campaign_address = ?1 AND contributor = ?2
        "#,
    )
    .bind(&campaign)
    .bind(&contributor)
    .fetch_optional(&mut *tx)
    .await?;

    let new_contributor = match existing {
        Some((amount, last_block, last_log_index)) => {
            let total = parse_amount(&amount)?
                .checked_add(ev.amount)
                .ok_or_else(|| SyncError::InvalidAmount(format!("overflow adding to {amount}")))?;
            let newer = position > LogPosition::new(last_block.max(0) as u64, last_log_index.max(0) as u64);
            sqlx::query(
                r#"
                UPDATE contributions SET
                    amount         = ?3,
                    last_timestamp = CASE WHEN ?4 THEN ?5 ELSE last_timestamp END,
                    last_tx_hash   = CASE WHEN ?4 THEN ?6 ELSE last_tx_hash END,
                    last_block     = CASE WHEN ?4 THEN ?7 ELSE last_block END,
                    last_log_index = CASE WHEN ?4 THEN ?8 ELSE last_log_index END
                WHERE campaign_address = ?1 AND contributor = ?2
                "#,
            )
            .bind(&campaign)
            .bind(&contributor)
            .bind(total.to_string())
            .bind(newer)
            .bind(timestamp)
            .bind(&tx_hash)
            .bind(block)
            .bind(log_index)
            .execute(&mut *tx)
            .await?;
            false
        }
        None => {
            sqlx::query(
                r#"
                INSERT INTO contributions
                    (campaign_address, contributor, amount, last_timestamp, last_tx_hash, last_block, last_log_index)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(&campaign)
            .bind(&contributor)
            .bind(ev.amount.to_string())
            .bind(timestamp)
            .bind(&tx_hash)
            .bind(block)
            .bind(log_index)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "UPDATE campaigns SET contributor_count = contributor_count + 1 WHERE contract_address = ?1",
            )
            .bind(&campaign)
            .execute(&mut *tx)
            .await?;
            true
        }
    };

    let newer_than_financials =
        position > LogPosition::new(fin_block.max(0) as u64, fin_log.max(0) as u64);
    let after_snapshot = block > snapshot_block;
    let raised_advanced =
        newer_than_financials && after_snapshot && ev.total_raised >= parse_amount(&raised)?;

    if raised_advanced {
        sqlx::query(
            r#"
            UPDATE campaigns SET
                raised_amount        = ?2,
                financials_block     = ?3,
                financials_log_index = ?4,
                updated_at           = ?5
            WHERE contract_address = ?1
            "#,
        )
        .bind(&campaign)
        .bind(ev.total_raised.to_string())
        .bind(block)
        .bind(log_index)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    } else {
        sqlx::query("UPDATE campaigns SET updated_at = ?2 WHERE contract_address = ?1")
            .bind(&campaign)
            .bind(now)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(ContributionWrite::Applied {
        new_contributor,
        raised_advanced,
    })
}

/// Overwrite chain-synced fields from an authoritative snapshot. When the
/// snapshot lowers `raised_amount`, `drift_from` carries the previous value
/// and an audit row is written in the same transaction.
///
/// Once a campaign has been finalized its status flags are frozen: the
/// snapshot still updates the amount, never `is_active` or `is_successful`.
pub async fn set_financials(
    pool: &SqlitePool,
    address: &str,
    snapshot: &ChainSnapshot,
    drift_from: Option<U256>,
    now: i64,
) -> Result<()> {
    let mut tx = pool.begin().await?;

    if let Some(previous) = drift_from {
        sqlx::query(
            r#"
            INSERT INTO drift_corrections
                (campaign_address, mirrored_amount, chain_amount, snapshot_block, corrected_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(address)
        .bind(previous.to_string())
        .bind(snapshot.raised_amount.to_string())
        .bind(snapshot.block_number as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    let rows = sqlx::query(
        r#"
        UPDATE campaigns SET
            raised_amount  = ?2,
            is_active      = CASE WHEN finalized_at IS NULL THEN ?3 ELSE 0 END,
            is_successful  = CASE WHEN finalized_at IS NULL THEN ?4 ELSE is_successful END,
            snapshot_block = MAX(snapshot_block, ?5),
            last_synced_at = ?6,
            updated_at     = ?6
        WHERE contract_address = ?1
        "#,
    )
    .bind(address)
    .bind(snapshot.raised_amount.to_string())
    .bind(snapshot.is_active)
    .bind(snapshot.is_successful)
    .bind(snapshot.block_number as i64)
    .bind(now)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if rows == 0 {
        return Err(SyncError::NotFound(address.to_string()));
    }
    tx.commit().await?;
    Ok(())
}

/// Flip an ended campaign to its final outcome. Compare-and-set: returns
/// `true` only for the call that actually performed the transition.
pub async fn finalize_campaign(
    pool: &SqlitePool,
    address: &str,
    successful: bool,
    now: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE campaigns SET
            is_active     = 0,
            is_successful = ?2,
            finalized_at  = ?3,
            updated_at    = ?3
        WHERE contract_address = ?1 AND is_active = 1 AND finalized_at IS NULL
        "#,
    )
    .bind(address)
    .bind(successful)
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

// ─────────────────────────────────────────────────────────
// Local-only writes (API layer)
// ─────────────────────────────────────────────────────────

/// Edit application-owned fields. Chain-synced columns are not reachable from here.
pub async fn update_local_fields(
    pool: &SqlitePool,
    address: &str,
    update: &LocalFieldsUpdate,
    now: i64,
) -> Result<bool> {
    let tags = update.tags.as_ref().map(serde_json::to_string).transpose()?;
    let rows = sqlx::query(
        r#"
        UPDATE campaigns SET
            title       = COALESCE(?2, title),
            description = COALESCE(?3, description),
            category    = COALESCE(?4, category),
            tags        = COALESCE(?5, tags),
            video_url   = COALESCE(?6, video_url),
            is_featured = COALESCE(?7, is_featured),
            updated_at  = ?8
        WHERE contract_address = ?1
        "#,
    )
    .bind(address)
    .bind(&update.title)
    .bind(&update.description)
    .bind(&update.category)
    .bind(tags)
    .bind(&update.video_url)
    .bind(update.is_featured)
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

pub async fn increment_views(pool: &SqlitePool, address: &str) -> Result<bool> {
    let rows = sqlx::query("UPDATE campaigns SET views = views + 1 WHERE contract_address = ?1")
        .bind(address)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows == 1)
}

// ─────────────────────────────────────────────────────────
// Reads
// ─────────────────────────────────────────────────────────

pub async fn find_campaign_by_address(
    pool: &SqlitePool,
    address: &str,
) -> Result<Option<CampaignRecord>> {
    let sql = format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE contract_address = ?1");
    let row = sqlx::query_as::<_, CampaignRecord>(&sql)
        .bind(address)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

#[derive(Debug, Clone, Default)]
pub struct CampaignFilter {
    pub active: Option<bool>,
    pub category: Option<String>,
    pub creator: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Read-side listing, newest first.
pub async fn list_campaigns(pool: &SqlitePool, filter: &CampaignFilter) -> Result<Vec<CampaignRecord>> {
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE 1 = 1"));
    if let Some(active) = filter.active {
        qb.push(" AND is_active = ").push_bind(active);
    }
    if let Some(category) = &filter.category {
        qb.push(" AND category = ").push_bind(category.clone());
    }
    if let Some(creator) = &filter.creator {
        qb.push(" AND creator = ").push_bind(creator.to_lowercase());
    }
    qb.push(" ORDER BY created_at DESC, campaign_id DESC LIMIT ")
        .push_bind(filter.limit.unwrap_or(100).clamp(1, 500))
        .push(" OFFSET ")
        .push_bind(filter.offset.unwrap_or(0).max(0));

    let rows = qb.build_query_as::<CampaignRecord>().fetch_all(pool).await?;
    Ok(rows)
}

/// Addresses of every mirrored campaign, used to scope contribution log queries.
pub async fn all_campaign_addresses(pool: &SqlitePool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT contract_address FROM campaigns ORDER BY campaign_id ASC")
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(a,)| a).collect())
}

pub async fn active_campaign_addresses(pool: &SqlitePool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT contract_address FROM campaigns WHERE is_active = 1 ORDER BY campaign_id ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(a,)| a).collect())
}

/// Active, not yet finalized campaigns whose deadline is at or before `now`.
pub async fn campaigns_past_deadline(pool: &SqlitePool, now: i64) -> Result<Vec<CampaignRecord>> {
    let sql = format!(
        "SELECT {CAMPAIGN_COLUMNS} FROM campaigns
         WHERE is_active = 1 AND finalized_at IS NULL AND deadline <= ?1
         ORDER BY deadline ASC"
    );
    let rows = sqlx::query_as::<_, CampaignRecord>(&sql)
        .bind(now)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn contributions_for_campaign(
    pool: &SqlitePool,
    address: &str,
) -> Result<Vec<ContributionRecord>> {
    let rows = sqlx::query_as::<_, ContributionRecord>(
        r#"
        SELECT campaign_address, contributor, amount, last_timestamp, last_tx_hash,
               last_block, last_log_index
        FROM   contributions
        WHERE  campaign_address = ?1
        ORDER  BY last_block ASC, last_log_index ASC
        "#,
    )
    .bind(address)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn contributions_by_contributor(
    pool: &SqlitePool,
    contributor: &str,
) -> Result<Vec<ContributionRecord>> {
    let rows = sqlx::query_as::<_, ContributionRecord>(
        r#"
        SELECT campaign_address, contributor, amount, last_timestamp, last_tx_hash,
               last_block, last_log_index
        FROM   contributions
        WHERE  contributor = ?1
        ORDER  BY last_block DESC, last_log_index DESC
        "#,
    )
    .bind(contributor)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DriftCorrection {
    pub campaign_address: String,
    pub mirrored_amount: String,
    pub chain_amount: String,
    pub snapshot_block: i64,
    pub corrected_at: i64,
}

pub async fn drift_corrections_for(pool: &SqlitePool, address: &str) -> Result<Vec<DriftCorrection>> {
    let rows = sqlx::query_as::<_, DriftCorrection>(
        r#"
        SELECT campaign_address, mirrored_amount, chain_amount, snapshot_block, corrected_at
        FROM   drift_corrections
        WHERE  campaign_address = ?1
        ORDER  BY id ASC
        "#,
    )
    .bind(address)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
