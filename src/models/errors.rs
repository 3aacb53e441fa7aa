use alloy_primitives::TxHash;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Key not found in cache: {key}")]
    NotFound { key: String },
    #[error("Shared cache tier error: {0}")]
    Shared(String),
    #[error("Cached value for {key} is not a number: {value}")]
    NotANumber { key: String, value: String },
    #[error("Failed to encode cache entry: {0}")]
    Codec(#[from] serde_json::Error),
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound { .. })
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Shared(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("Failed to fetch transaction {tx_hash}: {reason}")]
    TransactionFetch { tx_hash: TxHash, reason: String },
    #[error("Node returned no transaction for {tx_hash}")]
    MissingTransaction { tx_hash: TxHash },
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Failed to connect to stream endpoint: {0}")]
    Connect(String),
    #[error("Failed to send frame to stream socket: {0}")]
    Send(String),
    #[error("Stream socket closed")]
    Closed,
    #[error("Invalid stream frame: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("Management bus error: {0}")]
    Bus(String),
}

impl From<redis::RedisError> for StreamError {
    fn from(e: redis::RedisError) -> Self {
        StreamError::Bus(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid config value {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
    #[error("Invalid stream endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
}
