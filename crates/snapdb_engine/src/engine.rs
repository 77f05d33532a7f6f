//! Storage engine trait definitions.

use crate::error::EngineResult;

/// A stored row: an opaque value blob plus an optional metadata blob.
///
/// Engines do not interpret either blob. Decoding is owned by the layers
/// above the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// The row's value bytes.
    pub value: Vec<u8>,
    /// The row's metadata bytes, if any.
    pub metadata: Option<Vec<u8>>,
}

impl Row {
    /// Creates a row from value and metadata bytes.
    #[must_use]
    pub fn new(value: Vec<u8>, metadata: Option<Vec<u8>>) -> Self {
        Self { value, metadata }
    }
}

/// An embedded ACID storage engine.
///
/// Engines are **single-writer/multi-reader**: any number of connections may
/// hold concurrent read transactions, but at most one connection may have a
/// write transaction open at any instant. A second concurrent `begin_write`
/// fails with [`crate::EngineError::WriterActive`]; callers are expected to
/// serialize writers externally.
///
/// # Invariants
///
/// - A read transaction observes an immutable snapshot of the committed
///   state as of `begin_read`.
/// - `commit_write` is the durable commit: once it returns, the transaction's
///   rows survive process termination and are visible to subsequently opened
///   read transactions.
/// - The internal key-value area (`kv_get`/`kv_put`) participates in
///   transactions when one is open on the handle, so a marker written inside
///   a write transaction becomes visible exactly when the data does.
pub trait StorageEngine: Send + Sync {
    /// Opens a new connection handle to the engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine is closed or the connection limit is
    /// exhausted.
    fn connect(&self) -> EngineResult<Box<dyn EngineConnection>>;
}

/// One connection handle to a storage engine.
///
/// A handle is owned by exactly one user at a time and is not itself
/// thread-safe; callers serialize access to it. At most one transaction
/// (read or write) may be open per handle.
pub trait EngineConnection: Send {
    /// Opens a read transaction, pinning a snapshot of the committed state.
    ///
    /// # Errors
    ///
    /// Returns an error if a transaction is already open on this handle.
    fn begin_read(&mut self) -> EngineResult<()>;

    /// Closes the current read transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if no read transaction is open.
    fn end_read(&mut self) -> EngineResult<()>;

    /// Opens the engine's single write transaction.
    ///
    /// # Errors
    ///
    /// Returns [`crate::EngineError::WriterActive`] if another handle holds
    /// the write transaction, or an error if a transaction is already open
    /// on this handle.
    fn begin_write(&mut self) -> EngineResult<()>;

    /// Durably commits the current write transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if no write transaction is open or the commit fails;
    /// on failure the engine rolls the transaction back itself.
    fn commit_write(&mut self) -> EngineResult<()>;

    /// Rolls back the current write transaction, discarding its changes.
    ///
    /// # Errors
    ///
    /// Returns an error if no write transaction is open.
    fn rollback_write(&mut self) -> EngineResult<()>;

    /// Fetches a row within the current transaction's view.
    ///
    /// # Errors
    ///
    /// Returns an error if no transaction is open.
    fn get(&mut self, key: &str) -> EngineResult<Option<Row>>;

    /// Inserts or replaces a row within the current write transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if no write transaction is open.
    fn put(&mut self, key: &str, value: Vec<u8>, metadata: Option<Vec<u8>>) -> EngineResult<()>;

    /// Deletes a row within the current write transaction.
    ///
    /// Deleting an absent key is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if no write transaction is open.
    fn delete(&mut self, key: &str) -> EngineResult<()>;

    /// Runs a log checkpoint, folding the engine's write-ahead state into
    /// the main store.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint fails. Checkpoint failures never
    /// affect committed data.
    fn checkpoint(&mut self) -> EngineResult<()>;

    /// Reads from the engine's reserved internal key-value area.
    ///
    /// Inside a transaction this reads the transaction's view; outside one
    /// it reads the current committed state.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn kv_get(&mut self, key: &str) -> EngineResult<Option<Vec<u8>>>;

    /// Writes to the engine's reserved internal key-value area.
    ///
    /// Inside a write transaction the write commits with the transaction;
    /// outside one it is applied durably right away.
    ///
    /// # Errors
    ///
    /// Returns an error if called inside a read transaction or the write
    /// fails.
    fn kv_put(&mut self, key: &str, value: &[u8]) -> EngineResult<()>;
}
