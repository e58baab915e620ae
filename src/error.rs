//! Error types for the swap coordinator

use thiserror::Error;

/// Main error type for swap coordination
#[derive(Error, Debug)]
pub enum SwapError {
    /// Fatal setup problem: hash-function mismatch, timelock margin violated,
    /// unknown chain. Never retried and never allowed to move funds.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    /// An observed lock failed parameter checks
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Signer error: {0}")]
    Signer(String),

    #[error("Event parsing error: {0}")]
    EventParsing(String),

    #[error("Swap {swap_id} not found")]
    SwapNotFound { swap_id: String },

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: u64 },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("A watcher is already polling chain {chain_id} for this swap")]
    WatcherBusy { chain_id: u64 },

    /// The swap's driver was asked to stop while waiting on a chain
    #[error("Swap driver stopped")]
    Stopped,

    #[error("Secure randomness unavailable: {0}")]
    Randomness(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SwapError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SwapError::ChainConnection { .. }
                | SwapError::Timeout { .. }
                | SwapError::Signer(_)
                | SwapError::Database(_)
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            SwapError::Config(_)
                | SwapError::Randomness(_)
                | SwapError::Validation(_)
        )
    }
}

/// Result type for swap operations
pub type SwapResult<T> = Result<T, SwapError>;
