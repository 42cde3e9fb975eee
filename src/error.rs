//! Error types for the tiered document cache

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the document cache
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Tier 1 Errors
    // =========================================================================
    /// Caller referenced a document type that was never declared
    #[error("Partition not found for document type: {document_type}")]
    PartitionNotFound { document_type: String },

    // =========================================================================
    // Bank Errors
    // =========================================================================
    /// Request can never fit in the bank, regardless of eviction
    #[error("Bank {bank} cannot hold {requested} bytes (capacity {capacity})")]
    Capacity {
        bank: String,
        requested: u64,
        capacity: u64,
    },

    /// Eviction could not free enough unpinned space right now
    #[error("Bank {bank} exhausted: requested {requested} bytes, {available} reclaimable")]
    BankExhausted {
        bank: String,
        requested: u64,
        available: u64,
    },

    /// Bank name is not configured
    #[error("Bank not found: {0}")]
    BankNotFound(String),

    // =========================================================================
    // Tier 2 / Sync Errors
    // =========================================================================
    /// Distributed backend unreachable or rejected the call
    #[error("Distributed tier unavailable: {0}")]
    TierUnavailable(String),

    /// Distributed call exceeded its deadline
    #[error("Operation {operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Pub/sub message could not be applied
    #[error("Sync conflict: {0}")]
    SyncConflict(String),

    /// Backend-specific failure
    #[error("Backend error: {0}")]
    Backend(String),

    // =========================================================================
    // General Errors
    // =========================================================================
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::BankExhausted { .. }
                | Error::TierUnavailable(_)
                | Error::Timeout { .. }
                | Error::Backend(_)
        )
    }
}
