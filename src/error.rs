//! Error types shared by the recorder and the settlement bot

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, BettingError>;

/// Main error type for the library
#[derive(Debug, Error)]
pub enum BettingError {
    /// Missing or malformed setting, reported at startup
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// RPC connection or subscription error
    #[error("Provider error: {0}")]
    Provider(String),

    /// Read-only contract call error
    #[error("Contract call error: {0}")]
    ContractCall(String),

    /// Transaction submission or confirmation error
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Log could not be decoded into a bet event
    #[error("Decoding error: {0}")]
    Decoding(String),

    /// Persistent store error
    #[error("Storage error: {0}")]
    Storage(String),

    /// An event record with the same hash is already stored
    #[error("Duplicate event: {hash}")]
    DuplicateEvent { hash: String },

    /// Remote call did not finish in time
    #[error("Timed out after {secs}s: {operation}")]
    Timeout { operation: String, secs: u64 },

    /// Remote call abandoned because of shutdown
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl BettingError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, BettingError::DuplicateEvent { .. })
    }
}

impl From<tokio_postgres::Error> for BettingError {
    fn from(e: tokio_postgres::Error) -> Self {
        BettingError::Storage(e.to_string())
    }
}

impl From<config::ConfigError> for BettingError {
    fn from(e: config::ConfigError) -> Self {
        BettingError::Configuration(e.to_string())
    }
}
