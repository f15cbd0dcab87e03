//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use alloy_primitives::Address;

use crate::errors::{Result, SyncError};
use crate::scheduler::ScheduleConfig;
use crate::subscriber::SubscriberConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// Ethereum JSON-RPC endpoint
    pub rpc_url: String,
    /// CrowdfundingFactory contract that emits `CampaignCreated`
    pub factory_address: Address,
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// How often (in seconds) to poll for new logs
    pub poll_interval_secs: u64,
    /// Widest block range requested per `eth_getLogs` call
    pub log_page_blocks: u64,
    /// Block to start from if no cursor is saved
    pub start_block: u64,
    /// Blocks behind the tip before logs are consumed
    pub confirmations: u64,
    /// Attempts per chain read before the error is surfaced
    pub rpc_max_attempts: u32,
    /// First backoff delay; doubles on every retry
    pub rpc_backoff_ms: u64,
    /// Batches buffered between the subscriber and the consumer
    pub event_queue_capacity: usize,
    pub resync_interval_secs: u64,
    /// Pause between campaigns during a resync sweep
    pub resync_pacing_ms: u64,
    pub deadline_interval_secs: u64,
    pub stats_cache_ttl_secs: u64,
    /// Where campaign-success notifications are POSTed; log-only when unset
    pub notify_webhook_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let factory = env_var("FACTORY_ADDRESS").map_err(|_| {
            SyncError::Config("FACTORY_ADDRESS environment variable is required".to_string())
        })?;

        Ok(Config {
            rpc_url: env_var("RPC_URL").unwrap_or_else(|_| "http://127.0.0.1:8545".to_string()),
            factory_address: Address::from_str(&factory)
                .map_err(|_| SyncError::Config(format!("Invalid FACTORY_ADDRESS: {factory}")))?,
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./campaign_mirror.db".to_string()),
            api_port: parsed("API_PORT", 3001)?,
            poll_interval_secs: parsed("POLL_INTERVAL_SECS", 5)?,
            log_page_blocks: parsed("LOG_PAGE_BLOCKS", 500)?,
            start_block: parsed("START_BLOCK", 0)?,
            confirmations: parsed("CONFIRMATIONS", 3)?,
            rpc_max_attempts: parsed("RPC_MAX_ATTEMPTS", 3)?,
            rpc_backoff_ms: parsed("RPC_BACKOFF_MS", 500)?,
            event_queue_capacity: parsed("EVENT_QUEUE_CAPACITY", 16)?,
            resync_interval_secs: parsed("RESYNC_INTERVAL_SECS", 600)?,
            resync_pacing_ms: parsed("RESYNC_PACING_MS", 1000)?,
            deadline_interval_secs: parsed("DEADLINE_INTERVAL_SECS", 3600)?,
            stats_cache_ttl_secs: parsed("STATS_CACHE_TTL_SECS", 30)?,
            notify_webhook_url: env_var("NOTIFY_WEBHOOK_URL").ok(),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn rpc_backoff(&self) -> Duration {
        Duration::from_millis(self.rpc_backoff_ms)
    }

    pub fn stats_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.stats_cache_ttl_secs)
    }

    pub fn subscriber(&self) -> SubscriberConfig {
        SubscriberConfig {
            factory: self.factory_address,
            start_block: self.start_block,
            confirmations: self.confirmations,
            page_blocks: self.log_page_blocks.max(1),
            poll_interval: self.poll_interval(),
        }
    }

    pub fn schedule(&self) -> ScheduleConfig {
        ScheduleConfig {
            resync_interval: Duration::from_secs(self.resync_interval_secs.max(1)),
            resync_pacing: Duration::from_millis(self.resync_pacing_ms),
            deadline_interval: Duration::from_secs(self.deadline_interval_secs.max(1)),
        }
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| SyncError::Config(format!("Missing env var: {key}")))
}

fn parsed<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env_var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| SyncError::Config(format!("Invalid {key}: {raw}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
impl Config {
    /// Defaults with a fixed factory, for tests that never touch the environment.
    pub fn for_tests() -> Self {
        Config {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            factory_address: Address::repeat_byte(0xfa),
            database_url: "sqlite::memory:".to_string(),
            api_port: 0,
            poll_interval_secs: 1,
            log_page_blocks: 100,
            start_block: 0,
            confirmations: 0,
            rpc_max_attempts: 3,
            rpc_backoff_ms: 1,
            event_queue_capacity: 4,
            resync_interval_secs: 600,
            resync_pacing_ms: 0,
            deadline_interval_secs: 3600,
            stats_cache_ttl_secs: 30,
            notify_webhook_url: None,
        }
    }
}
