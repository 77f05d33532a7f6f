//! Error types for the snapdb core.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in snapdb core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage engine error.
    #[error("engine error: {0}")]
    Engine(#[from] snapdb_engine::EngineError),

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// The persisted schema version is newer than this delegate supports.
    #[error("schema version too new: store is v{persisted}, delegate supports v{supported}")]
    SchemaVersionTooNew {
        /// Version found in the store.
        persisted: u32,
        /// Highest version the schema delegate supports.
        supported: u32,
    },

    /// Schema migration failed.
    #[error("migration failed: {message}")]
    MigrationFailed {
        /// Description of the failure.
        message: String,
    },

    /// The database has been closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// The connection's worker has shut down.
    #[error("connection is closed")]
    ConnectionClosed,
}

impl CoreError {
    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a migration failed error.
    pub fn migration_failed(message: impl Into<String>) -> Self {
        Self::MigrationFailed {
            message: message.into(),
        }
    }
}
