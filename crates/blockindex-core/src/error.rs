//! Error types for the blockindex pipeline.

use thiserror::Error;

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Lock contention, deadlock, or serialization failure. Safe to retry.
    #[error("storage contention: {0}")]
    Contention(String),

    /// Any other persistence failure.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// A JSON column could not be encoded or decoded.
    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Returns `true` for contention-class failures.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Contention(_))
    }
}

/// Errors that can occur during indexing.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("invalid block: {0}")]
    InvalidInput(String),

    #[error("execution status of transaction {transaction_id} in block {block_id} could not be resolved")]
    ExecutionStatusUnresolved {
        transaction_id: String,
        block_id: String,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("module effect '{module_command}' failed: {reason}")]
    Module {
        module_command: String,
        reason: String,
    },

    #[error("block {incoming} conflicts with final block {existing} at height {height}")]
    FinalityViolation {
        height: u64,
        existing: String,
        incoming: String,
    },

    #[error("queue '{0}' is closed")]
    QueueClosed(String),

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if the failed job should be re-delivered later.
    ///
    /// Storage contention and connector failures are transient; everything
    /// else signals bad input or a broken invariant and is final for the job.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_contention(),
            Self::Rpc(_) => true,
            _ => false,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidInput(reason.into())
    }
}
