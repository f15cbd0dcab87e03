//! Ethereum JSON-RPC client for `eth_call`, `eth_getLogs` and block lookups,
//! plus decoding of raw logs into [`DomainEvent`]s.
//!
//! ## Resilience
//!
//! * Every request is retried with exponential back-off while the failure is
//!   transient (transport error, HTTP 429, non-deterministic RPC error), for
//!   at most `max_attempts` attempts. The last error is returned to the caller.
//! * Reverts, malformed payloads and unknown methods are never retried.

use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U64};
use alloy_sol_types::SolEvent;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::abi::{ICampaign, ICrowdfundingFactory};
use crate::errors::{ChainReadError, Result, SyncError};
use crate::events::{
    canonical, CampaignCreatedEvent, ContributionReceivedEvent, DomainEvent,
};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
pub struct BlockHeader {
    pub hash: B256,
}

/// A log entry as returned by `eth_getLogs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: Option<U64>,
    pub block_hash: Option<B256>,
    pub transaction_hash: Option<B256>,
    pub log_index: Option<U64>,
    /// Non-standard; some nodes include it.
    pub block_timestamp: Option<U64>,
    #[serde(default)]
    pub removed: bool,
}

/// Parameters for one `eth_getLogs` call.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub from_block: u64,
    pub to_block: u64,
    pub addresses: Vec<Address>,
    /// Positional topic filters; `None` matches anything, a list matches any of it.
    pub topics: Vec<Option<Vec<B256>>>,
}

impl LogFilter {
    fn to_params(&self) -> Value {
        let topics: Vec<Value> = self
            .topics
            .iter()
            .map(|t| match t {
                None => Value::Null,
                Some(options) => json!(options),
            })
            .collect();

        let mut params = json!({
            "fromBlock": quantity(self.from_block),
            "toBlock": quantity(self.to_block),
            "topics": topics,
        });
        if !self.addresses.is_empty() {
            let addresses: Vec<String> = self.addresses.iter().map(canonical).collect();
            params["address"] = json!(addresses);
        }
        params
    }
}

fn quantity(n: u64) -> String {
    format!("0x{n:x}")
}

// ─────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RpcClient {
    client: Client,
    url: String,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl RpcClient {
    pub fn new(client: Client, url: impl Into<String>, max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            max_attempts: max_attempts.max(1),
            initial_backoff,
        }
    }

    pub async fn block_number(&self) -> std::result::Result<u64, ChainReadError> {
        let n: U64 = self.request("eth_blockNumber", json!([])).await?;
        Ok(n.to::<u64>())
    }

    /// Hash of the canonical block at `number`, or `None` if the node does not know it.
    pub async fn block_hash(&self, number: u64) -> std::result::Result<Option<B256>, ChainReadError> {
        let header: Option<BlockHeader> = self
            .request("eth_getBlockByNumber", json!([quantity(number), false]))
            .await?;
        Ok(header.map(|h| h.hash))
    }

    /// Read-only contract call against the latest block.
    pub async fn call(&self, to: Address, data: Vec<u8>) -> std::result::Result<Bytes, ChainReadError> {
        let params = json!([
            { "to": canonical(&to), "data": Bytes::from(data) },
            "latest"
        ]);
        self.request("eth_call", params).await
    }

    pub async fn get_logs(&self, filter: &LogFilter) -> std::result::Result<Vec<RawLog>, ChainReadError> {
        let logs: Vec<RawLog> = self.request("eth_getLogs", json!([filter.to_params()])).await?;
        debug!(
            from = filter.from_block,
            to = filter.to_block,
            "Fetched {} logs",
            logs.len()
        );
        Ok(logs)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> std::result::Result<T, ChainReadError> {
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;

        loop {
            match self.request_once(method, &params).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!("RPC {method} failed (attempt {attempt}, retry in {backoff:?}): {e}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn request_once<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &Value,
    ) -> std::result::Result<T, ChainReadError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params,
            }))
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ChainReadError::RateLimited);
        }

        let body: RpcResponse = resp.json().await.map_err(|e| {
            if e.is_decode() {
                ChainReadError::Malformed(format!("{method}: {e}"))
            } else {
                ChainReadError::Transport(e)
            }
        })?;

        if let Some(err) = body.error {
            return Err(ChainReadError::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        serde_json::from_value(body.result.unwrap_or(Value::Null))
            .map_err(|e| ChainReadError::Malformed(format!("{method}: {e}")))
    }
}

// ─────────────────────────────────────────────────────────
// Log decoding
// ─────────────────────────────────────────────────────────

/// Decode a list of raw logs into domain events, dropping (with a warning)
/// anything that fails to decode. Unrelated topics are skipped silently.
pub fn decode_logs(raw: &[RawLog], factory: Address) -> Vec<DomainEvent> {
    raw.iter()
        .filter_map(|log| match decode_log(log, factory) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    address = %canonical(&log.address),
                    tx = ?log.transaction_hash,
                    "Dropping undecodable log: {e}"
                );
                None
            }
        })
        .collect()
}

/// Decode one log. `Ok(None)` means the log is not one the mirror follows.
pub fn decode_log(raw: &RawLog, factory: Address) -> Result<Option<DomainEvent>> {
    if raw.removed {
        debug!(tx = ?raw.transaction_hash, "Skipping removed log");
        return Ok(None);
    }
    let Some(topic0) = raw.topics.first().copied() else {
        return Ok(None);
    };

    if topic0 == ICrowdfundingFactory::CampaignCreated::SIGNATURE_HASH {
        if raw.address != factory {
            return Ok(None);
        }
        let (block_number, log_index) = position(raw)?;
        let ev = ICrowdfundingFactory::CampaignCreated::decode_raw_log(
            raw.topics.iter().copied(),
            &raw.data,
            true,
        )
        .map_err(|e| SyncError::Decode(format!("CampaignCreated: {e}")))?;

        return Ok(Some(DomainEvent::CampaignCreated(CampaignCreatedEvent {
            campaign_id: ev.campaignId.saturating_to::<u64>(),
            campaign_address: ev.campaignAddress,
            creator: ev.creator,
            goal_amount: ev.goalAmount,
            deadline: ev.deadline.saturating_to::<u64>(),
            block_number,
            log_index,
        })));
    }

    if topic0 == ICampaign::ContributionReceived::SIGNATURE_HASH {
        let (block_number, log_index) = position(raw)?;
        let ev = ICampaign::ContributionReceived::decode_raw_log(
            raw.topics.iter().copied(),
            &raw.data,
            true,
        )
        .map_err(|e| SyncError::Decode(format!("ContributionReceived: {e}")))?;
        let transaction_hash = raw
            .transaction_hash
            .ok_or_else(|| SyncError::Decode("contribution without transactionHash".to_string()))?;

        return Ok(Some(DomainEvent::ContributionReceived(ContributionReceivedEvent {
            campaign_address: raw.address,
            contributor: ev.contributor,
            amount: ev.amount,
            total_raised: ev.totalRaised,
            transaction_hash,
            block_number,
            log_index,
            block_timestamp: raw.block_timestamp.map(|t| t.to::<u64>() as i64),
        })));
    }

    Ok(None)
}

fn position(raw: &RawLog) -> Result<(u64, u64)> {
    let block_number = raw
        .block_number
        .ok_or_else(|| SyncError::Decode("log without blockNumber".to_string()))?;
    let log_index = raw
        .log_index
        .ok_or_else(|| SyncError::Decode("log without logIndex".to_string()))?;
    Ok((block_number.to::<u64>(), log_index.to::<u64>()))
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloy_primitives::U256;

    pub(crate) fn word(v: U256) -> B256 {
        B256::from(v.to_be_bytes::<32>())
    }

    pub(crate) fn created_log(
        factory: Address,
        id: u64,
        campaign: Address,
        creator: Address,
        goal: U256,
        deadline: u64,
        block: u64,
        log_index: u64,
    ) -> RawLog {
        let data = [goal.to_be_bytes::<32>(), U256::from(deadline).to_be_bytes::<32>()].concat();
        RawLog {
            address: factory,
            topics: vec![
                ICrowdfundingFactory::CampaignCreated::SIGNATURE_HASH,
                word(U256::from(id)),
                campaign.into_word(),
                creator.into_word(),
            ],
            data: Bytes::from(data),
            block_number: Some(U64::from(block)),
            block_hash: Some(B256::repeat_byte(block as u8)),
            transaction_hash: Some(B256::repeat_byte(0x11)),
            log_index: Some(U64::from(log_index)),
            block_timestamp: None,
            removed: false,
        }
    }

    pub(crate) fn contribution_log(
        campaign: Address,
        contributor: Address,
        amount: U256,
        total: U256,
        tx: B256,
        block: u64,
        log_index: u64,
    ) -> RawLog {
        let data = [amount.to_be_bytes::<32>(), total.to_be_bytes::<32>()].concat();
        RawLog {
            address: campaign,
            topics: vec![
                ICampaign::ContributionReceived::SIGNATURE_HASH,
                contributor.into_word(),
            ],
            data: Bytes::from(data),
            block_number: Some(U64::from(block)),
            block_hash: Some(B256::repeat_byte(block as u8)),
            transaction_hash: Some(tx),
            log_index: Some(U64::from(log_index)),
            block_timestamp: Some(U64::from(1_700_000_000u64)),
            removed: false,
        }
    }

    #[test]
    fn decode_campaign_created() {
        let factory = Address::repeat_byte(0xfa);
        let campaign = Address::repeat_byte(0xab);
        let creator = Address::repeat_byte(0x01);
        let goal = U256::from(10u64).pow(U256::from(19u64));
        let log = created_log(factory, 1, campaign, creator, goal, 1_800_000_000, 100, 2);

        let ev = decode_log(&log, factory).unwrap().unwrap();
        match ev {
            DomainEvent::CampaignCreated(e) => {
                assert_eq!(e.campaign_id, 1);
                assert_eq!(e.campaign_address, campaign);
                assert_eq!(e.creator, creator);
                assert_eq!(e.goal_amount.to_string(), "10000000000000000000");
                assert_eq!(e.deadline, 1_800_000_000);
                assert_eq!((e.block_number, e.log_index), (100, 2));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn campaign_created_from_other_contract_is_ignored() {
        let factory = Address::repeat_byte(0xfa);
        let log = created_log(
            Address::repeat_byte(0xee),
            1,
            Address::repeat_byte(0xab),
            Address::repeat_byte(0x01),
            U256::from(1u64),
            1,
            1,
            0,
        );
        assert!(decode_log(&log, factory).unwrap().is_none());
    }

    #[test]
    fn decode_contribution_received() {
        let campaign = Address::repeat_byte(0xab);
        let contributor = Address::repeat_byte(0x02);
        let amount = U256::from(3_000_000_000_000_000_000u64);
        let tx = B256::repeat_byte(0xde);
        let log = contribution_log(campaign, contributor, amount, amount, tx, 120, 0);

        let ev = decode_log(&log, Address::ZERO).unwrap().unwrap();
        let DomainEvent::ContributionReceived(e) = ev else {
            panic!("expected contribution");
        };
        assert_eq!(e.campaign_address, campaign);
        assert_eq!(e.contributor, contributor);
        assert_eq!(e.amount, amount);
        assert_eq!(e.total_raised, amount);
        assert_eq!(e.transaction_hash, tx);
        assert_eq!(e.block_timestamp, Some(1_700_000_000));
    }

    #[test]
    fn truncated_data_is_dropped_not_fatal() {
        let campaign = Address::repeat_byte(0xab);
        let mut bad = contribution_log(
            campaign,
            Address::repeat_byte(0x02),
            U256::from(1u64),
            U256::from(1u64),
            B256::repeat_byte(1),
            1,
            0,
        );
        bad.data = Bytes::from(vec![0u8; 7]);
        let good = contribution_log(
            campaign,
            Address::repeat_byte(0x03),
            U256::from(2u64),
            U256::from(3u64),
            B256::repeat_byte(2),
            1,
            1,
        );

        assert!(decode_log(&bad, Address::ZERO).is_err());
        let events = decode_logs(&[bad, good], Address::ZERO);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn removed_and_unknown_logs_are_skipped() {
        let mut removed = contribution_log(
            Address::repeat_byte(0xab),
            Address::repeat_byte(0x02),
            U256::from(1u64),
            U256::from(1u64),
            B256::repeat_byte(1),
            1,
            0,
        );
        removed.removed = true;
        assert!(decode_log(&removed, Address::ZERO).unwrap().is_none());

        let mut unknown = removed.clone();
        unknown.removed = false;
        unknown.topics[0] = B256::repeat_byte(0x99);
        assert!(decode_log(&unknown, Address::ZERO).unwrap().is_none());
    }

    #[test]
    fn raw_log_deserializes_from_node_json() {
        let raw = serde_json::json!({
            "address": "0xabababababababababababababababababababab",
            "topics": [
                format!("0x{}", hex::encode(ICampaign::ContributionReceived::SIGNATURE_HASH)),
                "0x0000000000000000000000000202020202020202020202020202020202020202"
            ],
            "data": format!("0x{}{}", "0".repeat(63) + "5", "0".repeat(63) + "9"),
            "blockNumber": "0x1b4",
            "blockHash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "transactionHash": "0x2222222222222222222222222222222222222222222222222222222222222222",
            "logIndex": "0x3",
            "removed": false
        });
        let log: RawLog = serde_json::from_value(raw).unwrap();
        assert_eq!(log.block_number, Some(U64::from(436u64)));

        let ev = decode_log(&log, Address::ZERO).unwrap().unwrap();
        let DomainEvent::ContributionReceived(e) = ev else {
            panic!("expected contribution");
        };
        assert_eq!(e.amount, U256::from(5u64));
        assert_eq!(e.total_raised, U256::from(9u64));
        assert_eq!(e.log_index, 3);
    }

    #[test]
    fn log_filter_params() {
        let filter = LogFilter {
            from_block: 16,
            to_block: 31,
            addresses: vec![Address::repeat_byte(0xab)],
            topics: vec![Some(vec![ICampaign::ContributionReceived::SIGNATURE_HASH])],
        };
        let params = filter.to_params();
        assert_eq!(params["fromBlock"], "0x10");
        assert_eq!(params["toBlock"], "0x1f");
        assert_eq!(
            params["address"][0],
            "0xabababababababababababababababababababab"
        );
    }
}
