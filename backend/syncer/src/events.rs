//! Domain events decoded from factory / campaign contract logs, and the
//! mirror records they are reconciled into.

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SyncError};

/// Total order of a log on the canonical chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct LogPosition {
    pub block_number: u64,
    pub log_index: u64,
}

impl LogPosition {
    pub fn new(block_number: u64, log_index: u64) -> Self {
        Self {
            block_number,
            log_index,
        }
    }
}

/// `CampaignCreated` emitted by the factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignCreatedEvent {
    pub campaign_id: u64,
    pub campaign_address: Address,
    pub creator: Address,
    pub goal_amount: U256,
    /// Unix seconds.
    pub deadline: u64,
    pub block_number: u64,
    pub log_index: u64,
}

/// `ContributionReceived` emitted by a campaign contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContributionReceivedEvent {
    pub campaign_address: Address,
    pub contributor: Address,
    pub amount: U256,
    /// Running total reported by the contract after this contribution.
    pub total_raised: U256,
    pub transaction_hash: B256,
    pub block_number: u64,
    pub log_index: u64,
    /// Present when the node includes `blockTimestamp` in log responses.
    pub block_timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    CampaignCreated(CampaignCreatedEvent),
    ContributionReceived(ContributionReceivedEvent),
}

impl DomainEvent {
    pub fn position(&self) -> LogPosition {
        match self {
            Self::CampaignCreated(e) => LogPosition::new(e.block_number, e.log_index),
            Self::ContributionReceived(e) => LogPosition::new(e.block_number, e.log_index),
        }
    }

    pub fn campaign_address(&self) -> Address {
        match self {
            Self::CampaignCreated(e) => e.campaign_address,
            Self::ContributionReceived(e) => e.campaign_address,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::CampaignCreated(_) => "campaign_created",
            Self::ContributionReceived(_) => "contribution_received",
        }
    }
}

/// Canonical lower-case `0x…` form used as the mirror key.
pub fn canonical(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_slice()))
}

pub fn parse_address(raw: &str) -> Result<Address> {
    raw.trim()
        .parse::<Address>()
        .map_err(|_| SyncError::InvalidAddress(raw.to_string()))
}

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Parse a decimal-string wei amount.
pub fn parse_amount(raw: &str) -> Result<U256> {
    raw.parse::<U256>()
        .map_err(|_| SyncError::InvalidAmount(raw.to_string()))
}

// ─────────────────────────────────────────────────────────
// Mirror records
// ─────────────────────────────────────────────────────────

/// One mirrored campaign row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CampaignRecord {
    pub contract_address: String,
    pub campaign_id: i64,
    pub creator: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub tags: String,
    pub image_url: String,
    pub video_url: Option<String>,
    pub goal_amount: String,
    pub raised_amount: String,
    pub deadline: i64,
    pub is_active: bool,
    pub is_successful: bool,
    pub contributor_count: i64,
    pub financials_block: i64,
    pub financials_log_index: i64,
    pub snapshot_block: i64,
    pub last_synced_at: Option<i64>,
    pub finalized_at: Option<i64>,
    pub views: i64,
    pub shares: i64,
    pub is_featured: bool,
    pub is_verified: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl CampaignRecord {
    pub fn raised(&self) -> Result<U256> {
        parse_amount(&self.raised_amount)
    }

    pub fn goal(&self) -> Result<U256> {
        parse_amount(&self.goal_amount)
    }

    /// Position of the last event that moved `raised_amount`.
    pub fn financials_position(&self) -> LogPosition {
        LogPosition::new(
            self.financials_block.max(0) as u64,
            self.financials_log_index.max(0) as u64,
        )
    }
}

/// A contributor's running total against one campaign.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ContributionRecord {
    pub campaign_address: String,
    pub contributor: String,
    pub amount: String,
    pub last_timestamp: i64,
    pub last_tx_hash: String,
    pub last_block: i64,
    pub last_log_index: i64,
}

/// Decoded `getStats()` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignStats {
    pub raised_amount: String,
    pub goal_amount: String,
    pub contributor_count: u64,
    pub days_left: u64,
    pub percentage_funded: u64,
}

/// Mutable fields owned by the application rather than the chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalFieldsUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub tags: Option<Vec<String>>,
    pub video_url: Option<String>,
    pub is_featured: Option<bool>,
}
