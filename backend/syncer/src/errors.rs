//! Application-wide error types.

use thiserror::Error;

/// Failure reading contract state over JSON-RPC.
#[derive(Debug, Error)]
pub enum ChainReadError {
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("rate-limited by RPC")]
    RateLimited,

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("no contract code at {0}")]
    ContractNotFound(String),
}

impl ChainReadError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::RateLimited => true,
            // -32600 invalid request, -32601 method not found, 3 / -32000 with
            // "revert" are deterministic; the remaining server errors are not.
            Self::Rpc { code, message } => {
                !(*code == -32600 || *code == -32601 || *code == 3 || message.contains("revert"))
            }
            Self::Malformed(_) | Self::ContractNotFound(_) => false,
        }
    }
}

impl From<alloy_sol_types::Error> for ChainReadError {
    fn from(e: alloy_sol_types::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Chain read error: {0}")]
    ChainRead(#[from] ChainReadError),

    #[error("Store unavailable: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Log decode error: {0}")]
    Decode(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl SyncError {
    /// Errors worth retrying on the next pass: RPC hiccups and store outages.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ChainRead(e) => e.is_transient(),
            Self::Store(_) | Self::Http(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revert_is_not_transient() {
        let err = ChainReadError::Rpc {
            code: -32000,
            message: "execution reverted".to_string(),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn server_error_is_transient() {
        let err = ChainReadError::Rpc {
            code: -32005,
            message: "limit exceeded".to_string(),
        };
        assert!(err.is_transient());
        assert!(SyncError::from(err).is_transient());
    }

    #[test]
    fn store_errors_are_retried() {
        assert!(SyncError::Store(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!SyncError::NotFound("0xabc".into()).is_transient());
    }
}
