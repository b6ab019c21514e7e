//! Error types for the payment ledger
//!
//! Expected business results (duplicate delivery, quota exceeded, already
//! granted, escrow held) are typed outcomes on the operations themselves,
//! not errors. Errors here are the unexpected cases.

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Payment ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// A provider reference is already attached to a different row.
    /// Indicates a bug or a replayed charge; logged loudly at the call site.
    #[error("Conflicting provider reference {reference}: already held by {holder}")]
    ConflictingReference {
        /// The contested reference
        reference: String,
        /// Id of the row already holding it
        holder: String,
    },

    /// Illegal state transition request
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Rejected transaction draft (non-positive amount, metadata/kind mismatch)
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    /// Webhook event not found
    #[error("Webhook event not found: {0}")]
    WebhookNotFound(String),

    /// Unlock attempt not found
    #[error("Unlock attempt not found: {0}")]
    AttemptNotFound(String),

    /// Entitlement not found
    #[error("Entitlement not found: {0}")]
    EntitlementNotFound(String),

    /// Transaction not found
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Error::Metrics(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
