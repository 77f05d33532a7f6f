//! Error types for storage engines.

use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in storage engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Another write transaction is already active on the engine.
    #[error("engine already has an active writer")]
    WriterActive,

    /// The operation requires an open transaction.
    #[error("no transaction is open on this handle")]
    NoTransaction,

    /// The operation cannot run while a transaction is open.
    #[error("a transaction is already open on this handle")]
    TransactionActive,

    /// The engine or handle has been closed.
    #[error("engine is closed")]
    Closed,

    /// I/O error from the underlying store.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The persisted store is corrupted or invalid.
    #[error("store corruption: {message}")]
    Corrupt {
        /// Description of the corruption.
        message: String,
    },
}

impl EngineError {
    /// Creates a corruption error.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }
}
