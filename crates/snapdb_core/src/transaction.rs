//! Read and read-write transactions.
//!
//! A transaction is transient and one-shot: it is created by the
//! connection, runs one caller body, and completes. It borrows the
//! connection's internals and cannot outlive the call that created it.

use crate::cache::CacheView;
use crate::changeset::ChangesetBuilder;
use crate::error::CoreResult;
use crate::types::WriteTimestamp;
use parking_lot::Mutex;
use snapdb_engine::EngineConnection;
use std::sync::Arc;

/// Lifecycle of a transaction. Transitions are one-way; violating them is a
/// protocol bug and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Active,
    Completed,
}

#[derive(Debug)]
pub(crate) struct TransactionPhase {
    phase: Phase,
}

impl TransactionPhase {
    pub(crate) fn new() -> Self {
        Self {
            phase: Phase::Created,
        }
    }

    pub(crate) fn begin(&mut self) {
        assert_eq!(
            self.phase,
            Phase::Created,
            "transaction begun twice; the snapshot protocol is broken"
        );
        self.phase = Phase::Active;
    }

    pub(crate) fn complete(&mut self) {
        assert_eq!(
            self.phase,
            Phase::Active,
            "transaction completed while not active; the snapshot protocol is broken"
        );
        self.phase = Phase::Completed;
    }

    fn assert_active(&self) {
        assert_eq!(
            self.phase,
            Phase::Active,
            "transaction used outside its body; the snapshot protocol is broken"
        );
    }
}

/// A read-only view of one snapshot of the database.
///
/// Lookups are served from the connection's caches when possible and fall
/// through to the open engine snapshot otherwise, populating the caches on
/// the way back.
pub struct ReadTransaction<'a> {
    engine: &'a mut dyn EngineConnection,
    cache: &'a Mutex<CacheView>,
    snapshot: WriteTimestamp,
    phase: TransactionPhase,
}

impl<'a> ReadTransaction<'a> {
    pub(crate) fn new(
        engine: &'a mut dyn EngineConnection,
        cache: &'a Mutex<CacheView>,
        snapshot: WriteTimestamp,
    ) -> Self {
        Self {
            engine,
            cache,
            snapshot,
            phase: TransactionPhase::new(),
        }
    }

    pub(crate) fn begin(&mut self) {
        self.phase.begin();
    }

    pub(crate) fn complete(&mut self) {
        self.phase.complete();
    }

    /// Returns the snapshot this transaction observes.
    #[must_use]
    pub fn snapshot(&self) -> WriteTimestamp {
        self.snapshot
    }

    /// Fetches a row's value.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine read fails.
    pub fn get(&mut self, key: &str) -> CoreResult<Option<Arc<Vec<u8>>>> {
        self.phase.assert_active();
        fetch_value(self.engine, self.cache, self.snapshot, key)
    }

    /// Fetches a row's metadata. Returns `None` both for an absent row and
    /// for a row without metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine read fails.
    pub fn get_metadata(&mut self, key: &str) -> CoreResult<Option<Arc<Vec<u8>>>> {
        self.phase.assert_active();
        fetch_metadata(self.engine, self.cache, self.snapshot, key)
    }
}

/// A read-write transaction accumulating a changeset as its body executes.
///
/// Writes go straight through to the open engine write transaction; reads
/// of keys this transaction already touched bypass the caches, so the
/// transaction always sees its own writes.
pub struct WriteTransaction<'a> {
    engine: &'a mut dyn EngineConnection,
    cache: &'a Mutex<CacheView>,
    builder: &'a mut ChangesetBuilder,
    snapshot: WriteTimestamp,
    phase: TransactionPhase,
}

impl<'a> WriteTransaction<'a> {
    pub(crate) fn new(
        engine: &'a mut dyn EngineConnection,
        cache: &'a Mutex<CacheView>,
        builder: &'a mut ChangesetBuilder,
        snapshot: WriteTimestamp,
    ) -> Self {
        Self {
            engine,
            cache,
            builder,
            snapshot,
            phase: TransactionPhase::new(),
        }
    }

    pub(crate) fn begin(&mut self) {
        self.phase.begin();
    }

    pub(crate) fn complete(&mut self) {
        self.phase.complete();
    }

    /// Returns the snapshot this transaction started from.
    #[must_use]
    pub fn snapshot(&self) -> WriteTimestamp {
        self.snapshot
    }

    /// Fetches a row's value, seeing this transaction's own writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine read fails.
    pub fn get(&mut self, key: &str) -> CoreResult<Option<Arc<Vec<u8>>>> {
        self.phase.assert_active();
        if self.builder.touched(key) {
            // The caches still hold pre-transaction state for this key;
            // only the engine's write view has the truth.
            return Ok(self.engine.get(key)?.map(|row| Arc::new(row.value)));
        }
        fetch_value(self.engine, self.cache, self.snapshot, key)
    }

    /// Fetches a row's metadata, seeing this transaction's own writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine read fails.
    pub fn get_metadata(&mut self, key: &str) -> CoreResult<Option<Arc<Vec<u8>>>> {
        self.phase.assert_active();
        if self.builder.touched(key) {
            return Ok(self
                .engine
                .get(key)?
                .and_then(|row| row.metadata.map(Arc::new)));
        }
        fetch_metadata(self.engine, self.cache, self.snapshot, key)
    }

    /// Inserts or replaces a row.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine write fails.
    pub fn put(&mut self, key: &str, value: Vec<u8>, metadata: Option<Vec<u8>>) -> CoreResult<()> {
        self.phase.assert_active();
        self.engine.put(key, value, metadata)?;
        self.builder.record_modified(key);
        Ok(())
    }

    /// Deletes a row.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine write fails.
    pub fn delete(&mut self, key: &str) -> CoreResult<()> {
        self.phase.assert_active();
        self.engine.delete(key)?;
        self.builder.record_deleted(key);
        Ok(())
    }
}

/// Cache-then-engine value lookup shared by both transaction kinds.
///
/// The fetched row is inserted into the caches only if the view timestamp
/// still equals the transaction's snapshot: a concurrent fan-out that
/// advanced the view in between has evicted this key for a newer commit,
/// and the stale row must not be resurrected.
fn fetch_value(
    engine: &mut dyn EngineConnection,
    cache: &Mutex<CacheView>,
    snapshot: WriteTimestamp,
    key: &str,
) -> CoreResult<Option<Arc<Vec<u8>>>> {
    if let Some(value) = cache.lock().objects.get(key) {
        return Ok(Some(Arc::clone(value)));
    }
    let Some(row) = engine.get(key)? else {
        return Ok(None);
    };
    let value = Arc::new(row.value);
    let metadata = row.metadata.map(Arc::new);
    let mut view = cache.lock();
    if view.timestamp == snapshot {
        view.objects.insert(key, Arc::clone(&value));
        view.metadata.insert(key, metadata);
    }
    Ok(Some(value))
}

fn fetch_metadata(
    engine: &mut dyn EngineConnection,
    cache: &Mutex<CacheView>,
    snapshot: WriteTimestamp,
    key: &str,
) -> CoreResult<Option<Arc<Vec<u8>>>> {
    if let Some(metadata) = cache.lock().metadata.get(key) {
        return Ok(metadata.clone());
    }
    let Some(row) = engine.get(key)? else {
        return Ok(None);
    };
    let value = Arc::new(row.value);
    let metadata = row.metadata.map(Arc::new);
    let mut view = cache.lock();
    if view.timestamp == snapshot {
        view.objects.insert(key, value);
        view.metadata.insert(key, metadata.clone());
    }
    Ok(metadata)
}
