//! Read-only access to campaign contract state.
//!
//! [`ChainReader`] is the seam between the reconciliation engine and the
//! JSON-RPC transport; only whitelisted view methods can be called through it.

use alloy_primitives::{Address, U256};
use alloy_sol_types::{SolCall, SolEvent};
use async_trait::async_trait;
use tracing::debug;

use crate::abi::{ICampaign, ICrowdfundingFactory};
use crate::errors::{ChainReadError, Result, SyncError};
use crate::events::{canonical, CampaignCreatedEvent, CampaignStats, DomainEvent};
use crate::rpc::{decode_log, LogFilter, RpcClient};

pub type ReadResult<T> = std::result::Result<T, ChainReadError>;

/// View methods the mirror is allowed to call on a campaign contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractMethod {
    RaisedAmount,
    IsActive,
    IsSuccessful,
    GetStats,
    GetContribution(Address),
    Title,
    Description,
    ImageUrl,
}

/// Decoded return value of a [`ContractMethod`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainValue {
    Amount(U256),
    Flag(bool),
    Text(String),
    Stats(CampaignStats),
}

impl ContractMethod {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RaisedAmount => "raisedAmount",
            Self::IsActive => "isActive",
            Self::IsSuccessful => "isSuccessful",
            Self::GetStats => "getStats",
            Self::GetContribution(_) => "getContribution",
            Self::Title => "title",
            Self::Description => "description",
            Self::ImageUrl => "imageUrl",
        }
    }

    pub fn calldata(&self) -> Vec<u8> {
        match *self {
            Self::RaisedAmount => ICampaign::raisedAmountCall {}.abi_encode(),
            Self::IsActive => ICampaign::isActiveCall {}.abi_encode(),
            Self::IsSuccessful => ICampaign::isSuccessfulCall {}.abi_encode(),
            Self::GetStats => ICampaign::getStatsCall {}.abi_encode(),
            Self::GetContribution(contributor) => {
                ICampaign::getContributionCall { contributor }.abi_encode()
            }
            Self::Title => ICampaign::titleCall {}.abi_encode(),
            Self::Description => ICampaign::descriptionCall {}.abi_encode(),
            Self::ImageUrl => ICampaign::imageUrlCall {}.abi_encode(),
        }
    }

    pub fn decode(&self, data: &[u8]) -> ReadResult<ChainValue> {
        let value = match self {
            Self::RaisedAmount => {
                ChainValue::Amount(ICampaign::raisedAmountCall::abi_decode_returns(data, true)?._0)
            }
            Self::IsActive => {
                ChainValue::Flag(ICampaign::isActiveCall::abi_decode_returns(data, true)?._0)
            }
            Self::IsSuccessful => {
                ChainValue::Flag(ICampaign::isSuccessfulCall::abi_decode_returns(data, true)?._0)
            }
            Self::GetContribution(_) => ChainValue::Amount(
                ICampaign::getContributionCall::abi_decode_returns(data, true)?._0,
            ),
            Self::Title => ChainValue::Text(ICampaign::titleCall::abi_decode_returns(data, true)?._0),
            Self::Description => {
                ChainValue::Text(ICampaign::descriptionCall::abi_decode_returns(data, true)?._0)
            }
            Self::ImageUrl => {
                ChainValue::Text(ICampaign::imageUrlCall::abi_decode_returns(data, true)?._0)
            }
            Self::GetStats => {
                let r = ICampaign::getStatsCall::abi_decode_returns(data, true)?;
                ChainValue::Stats(CampaignStats {
                    raised_amount: r._raisedAmount.to_string(),
                    goal_amount: r._goalAmount.to_string(),
                    contributor_count: r._contributorCount.saturating_to::<u64>(),
                    days_left: r._daysLeft.saturating_to::<u64>(),
                    percentage_funded: r._percentageFunded.saturating_to::<u64>(),
                })
            }
        };
        Ok(value)
    }
}

impl ChainValue {
    fn mismatch(self, method: ContractMethod) -> ChainReadError {
        ChainReadError::Malformed(format!("{} returned unexpected {self:?}", method.name()))
    }
}

/// Authoritative financial/status fields read in one go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSnapshot {
    pub raised_amount: U256,
    pub is_active: bool,
    pub is_successful: bool,
    /// Chain tip observed just before the reads.
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignDetails {
    pub title: String,
    pub description: String,
    pub image_url: String,
}

#[async_trait]
pub trait ChainReader: Send + Sync + 'static {
    /// Call one whitelisted view method on `campaign`.
    async fn read(&self, campaign: Address, method: ContractMethod) -> ReadResult<ChainValue>;

    async fn block_number(&self) -> ReadResult<u64>;

    /// Locate the factory's `CampaignCreated` log for `campaign`, if any.
    async fn find_creation(&self, campaign: Address) -> Result<Option<CampaignCreatedEvent>>;

    async fn amount(&self, campaign: Address, method: ContractMethod) -> ReadResult<U256> {
        match self.read(campaign, method).await? {
            ChainValue::Amount(v) => Ok(v),
            other => Err(other.mismatch(method)),
        }
    }

    async fn flag(&self, campaign: Address, method: ContractMethod) -> ReadResult<bool> {
        match self.read(campaign, method).await? {
            ChainValue::Flag(v) => Ok(v),
            other => Err(other.mismatch(method)),
        }
    }

    async fn text(&self, campaign: Address, method: ContractMethod) -> ReadResult<String> {
        match self.read(campaign, method).await? {
            ChainValue::Text(v) => Ok(v),
            other => Err(other.mismatch(method)),
        }
    }

    async fn snapshot(&self, campaign: Address) -> ReadResult<ChainSnapshot> {
        let block_number = self.block_number().await?;
        let (raised_amount, is_active, is_successful) = tokio::try_join!(
            self.amount(campaign, ContractMethod::RaisedAmount),
            self.flag(campaign, ContractMethod::IsActive),
            self.flag(campaign, ContractMethod::IsSuccessful),
        )?;
        Ok(ChainSnapshot {
            raised_amount,
            is_active,
            is_successful,
            block_number,
        })
    }

    async fn details(&self, campaign: Address) -> ReadResult<CampaignDetails> {
        let (title, description, image_url) = tokio::try_join!(
            self.text(campaign, ContractMethod::Title),
            self.text(campaign, ContractMethod::Description),
            self.text(campaign, ContractMethod::ImageUrl),
        )?;
        Ok(CampaignDetails {
            title,
            description,
            image_url,
        })
    }

    async fn stats(&self, campaign: Address) -> ReadResult<CampaignStats> {
        match self.read(campaign, ContractMethod::GetStats).await? {
            ChainValue::Stats(s) => Ok(s),
            other => Err(other.mismatch(ContractMethod::GetStats)),
        }
    }

    async fn contribution_of(&self, campaign: Address, contributor: Address) -> ReadResult<U256> {
        self.amount(campaign, ContractMethod::GetContribution(contributor))
            .await
    }
}

// ─────────────────────────────────────────────────────────
// JSON-RPC implementation
// ─────────────────────────────────────────────────────────

pub struct RpcChainReader {
    rpc: RpcClient,
    factory: Address,
    start_block: u64,
    page_blocks: u64,
}

impl RpcChainReader {
    pub fn new(rpc: RpcClient, factory: Address, start_block: u64, page_blocks: u64) -> Self {
        Self {
            rpc,
            factory,
            start_block,
            page_blocks: page_blocks.max(1),
        }
    }
}

#[async_trait]
impl ChainReader for RpcChainReader {
    async fn read(&self, campaign: Address, method: ContractMethod) -> ReadResult<ChainValue> {
        let data = self.rpc.call(campaign, method.calldata()).await?;
        if data.is_empty() {
            return Err(ChainReadError::ContractNotFound(canonical(&campaign)));
        }
        method.decode(&data)
    }

    async fn block_number(&self) -> ReadResult<u64> {
        self.rpc.block_number().await
    }

    async fn find_creation(&self, campaign: Address) -> Result<Option<CampaignCreatedEvent>> {
        let tip = self.rpc.block_number().await?;
        if tip < self.start_block {
            return Ok(None);
        }

        // The campaign topic is indexed, so most providers answer the whole
        // range in one call. Range-capped providers get a bounded fallback.
        match self.creation_in(campaign, self.start_block, tip).await {
            Ok(found) => return Ok(found),
            Err(SyncError::ChainRead(ChainReadError::Rpc { code, message })) => {
                debug!(campaign = %canonical(&campaign), code, "Full-range lookup refused: {message}");
            }
            Err(e) => return Err(e),
        }

        let span = self.page_blocks.saturating_mul(LOOKUP_SPAN_PAGES);
        for (from, to) in lookup_windows(self.start_block, tip, span, MAX_LOOKUP_WINDOWS) {
            if let Some(ev) = self.creation_in(campaign, from, to).await? {
                return Ok(Some(ev));
            }
        }

        debug!(campaign = %canonical(&campaign), "No CampaignCreated log from factory");
        Ok(None)
    }
}

/// Pages of `page_blocks` merged into one fallback lookup window.
const LOOKUP_SPAN_PAGES: u64 = 20;
/// Upper bound on `eth_getLogs` calls for one fallback lookup.
const MAX_LOOKUP_WINDOWS: usize = 8;

impl RpcChainReader {
    async fn creation_in(
        &self,
        campaign: Address,
        from: u64,
        to: u64,
    ) -> Result<Option<CampaignCreatedEvent>> {
        let filter = LogFilter {
            from_block: from,
            to_block: to,
            addresses: vec![self.factory],
            topics: vec![
                Some(vec![ICrowdfundingFactory::CampaignCreated::SIGNATURE_HASH]),
                None,
                Some(vec![campaign.into_word()]),
            ],
        };
        for log in self.rpc.get_logs(&filter).await? {
            if let Some(DomainEvent::CampaignCreated(ev)) = decode_log(&log, self.factory)? {
                if ev.campaign_address == campaign {
                    return Ok(Some(ev));
                }
            }
        }
        Ok(None)
    }
}

/// Newest-first block windows of `span` blocks between `start` and `tip`,
/// at most `max` of them.
fn lookup_windows(start: u64, tip: u64, span: u64, max: usize) -> Vec<(u64, u64)> {
    let span = span.max(1);
    let mut windows = Vec::new();
    let mut to = tip;
    while windows.len() < max && to >= start {
        let from = to.saturating_sub(span - 1).max(start);
        windows.push((from, to));
        if from == start {
            break;
        }
        to = from - 1;
    }
    windows
}

// ─────────────────────────────────────────────────────────
// In-memory chain for tests
// ─────────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::*;
    use alloy_sol_types::SolValue;

    #[test]
    fn calldata_starts_with_selector() {
        let data = ContractMethod::RaisedAmount.calldata();
        assert_eq!(data.len(), 4);
        assert_eq!(&data[..], &ICampaign::raisedAmountCall::SELECTOR[..]);

        let who = Address::repeat_byte(0x02);
        let data = ContractMethod::GetContribution(who).calldata();
        assert_eq!(data.len(), 4 + 32);
        assert_eq!(&data[16..36], who.as_slice());
    }

    #[test]
    fn decode_scalar_returns() {
        let raised = (U256::from(7u64),).abi_encode_params();
        assert_eq!(
            ContractMethod::RaisedAmount.decode(&raised).unwrap(),
            ChainValue::Amount(U256::from(7u64))
        );

        let active = (true,).abi_encode_params();
        assert_eq!(
            ContractMethod::IsActive.decode(&active).unwrap(),
            ChainValue::Flag(true)
        );

        let title = (String::from("Solar Roofs"),).abi_encode_params();
        assert_eq!(
            ContractMethod::Title.decode(&title).unwrap(),
            ChainValue::Text("Solar Roofs".to_string())
        );
    }

    #[test]
    fn decode_stats() {
        let encoded = (
            U256::from(3u64),
            U256::from(10u64),
            U256::from(2u64),
            U256::from(5u64),
            U256::from(30u64),
        )
            .abi_encode_params();
        let ChainValue::Stats(stats) = ContractMethod::GetStats.decode(&encoded).unwrap() else {
            panic!("expected stats");
        };
        assert_eq!(stats.raised_amount, "3");
        assert_eq!(stats.goal_amount, "10");
        assert_eq!(stats.contributor_count, 2);
        assert_eq!(stats.days_left, 5);
        assert_eq!(stats.percentage_funded, 30);
    }

    #[test]
    fn garbage_return_is_malformed() {
        let err = ContractMethod::GetStats.decode(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, ChainReadError::Malformed(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn lookup_windows_are_newest_first_and_capped() {
        assert_eq!(lookup_windows(0, 99, 40, 8), vec![(60, 99), (20, 59), (0, 19)]);
        assert_eq!(lookup_windows(50, 50, 10, 8), vec![(50, 50)]);

        let capped = lookup_windows(0, 20_000_000, 10_000, 8);
        assert_eq!(capped.len(), 8);
        assert_eq!(capped[0], (19_990_001, 20_000_000));
        assert_eq!(capped[7].0, 19_920_001);
    }
}
