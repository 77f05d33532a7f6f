//! In-memory reference engine.

use crate::engine::{EngineConnection, Row, StorageEngine};
use crate::error::{EngineError, EngineResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Committed engine state. Swapped wholesale on commit so read snapshots
/// are a cheap `Arc` clone.
#[derive(Debug, Default, Clone)]
struct Committed {
    rows: HashMap<String, Row>,
    internal: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
struct Shared {
    committed: RwLock<Arc<Committed>>,
    active_writers: AtomicU32,
    peak_writers: AtomicU32,
    checkpoint_count: AtomicU64,
    commits_since_checkpoint: AtomicU64,
}

/// An in-memory storage engine.
///
/// Suitable for tests and ephemeral databases. Committed state is held as an
/// `Arc`-wrapped map that is swapped atomically on commit, which gives every
/// read transaction a true point-in-time snapshot, and the single-writer
/// rule is enforced with an exclusivity counter.
///
/// Cloning a `MemoryEngine` yields another handle to the same store, which
/// is how tests model closing and reopening a database.
///
/// # Example
///
/// ```rust
/// use snapdb_engine::{MemoryEngine, StorageEngine};
///
/// let engine = MemoryEngine::new();
/// let mut conn = engine.connect().unwrap();
/// conn.begin_write().unwrap();
/// conn.put("user:1", b"alice".to_vec(), None).unwrap();
/// conn.commit_write().unwrap();
/// ```
#[derive(Debug, Default, Clone)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
}

impl MemoryEngine {
    /// Creates a new empty in-memory engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of currently active write transactions.
    #[must_use]
    pub fn active_writers(&self) -> u32 {
        self.shared.active_writers.load(Ordering::SeqCst)
    }

    /// Returns the highest number of simultaneously active write
    /// transactions ever observed. The single-writer rule holds iff this
    /// never exceeds 1.
    #[must_use]
    pub fn peak_writers(&self) -> u32 {
        self.shared.peak_writers.load(Ordering::SeqCst)
    }

    /// Returns the number of checkpoints run so far.
    #[must_use]
    pub fn checkpoint_count(&self) -> u64 {
        self.shared.checkpoint_count.load(Ordering::SeqCst)
    }

    /// Returns the number of commits since the last checkpoint.
    #[must_use]
    pub fn commits_since_checkpoint(&self) -> u64 {
        self.shared.commits_since_checkpoint.load(Ordering::SeqCst)
    }

    /// Returns the number of committed rows, for test assertions.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.shared.committed.read().rows.len()
    }
}

impl StorageEngine for MemoryEngine {
    fn connect(&self) -> EngineResult<Box<dyn EngineConnection>> {
        Ok(Box::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
            state: TxnState::Idle,
        }))
    }
}

#[derive(Debug)]
enum TxnState {
    Idle,
    Read(Arc<Committed>),
    Write(Committed),
}

/// One connection handle to a [`MemoryEngine`].
#[derive(Debug)]
pub struct MemoryConnection {
    shared: Arc<Shared>,
    state: TxnState,
}

impl MemoryConnection {
    fn release_writer(&self) {
        self.shared.active_writers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl EngineConnection for MemoryConnection {
    fn begin_read(&mut self) -> EngineResult<()> {
        match self.state {
            TxnState::Idle => {
                let snapshot = Arc::clone(&self.shared.committed.read());
                self.state = TxnState::Read(snapshot);
                Ok(())
            }
            _ => Err(EngineError::TransactionActive),
        }
    }

    fn end_read(&mut self) -> EngineResult<()> {
        match self.state {
            TxnState::Read(_) => {
                self.state = TxnState::Idle;
                Ok(())
            }
            _ => Err(EngineError::NoTransaction),
        }
    }

    fn begin_write(&mut self) -> EngineResult<()> {
        if !matches!(self.state, TxnState::Idle) {
            return Err(EngineError::TransactionActive);
        }
        // Exclusivity gate: exactly one writer engine-wide.
        if self
            .shared
            .active_writers
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EngineError::WriterActive);
        }
        let active = self.shared.active_writers.load(Ordering::SeqCst);
        self.shared
            .peak_writers
            .fetch_max(active, Ordering::SeqCst);

        let working = (**self.shared.committed.read()).clone();
        self.state = TxnState::Write(working);
        Ok(())
    }

    fn commit_write(&mut self) -> EngineResult<()> {
        match std::mem::replace(&mut self.state, TxnState::Idle) {
            TxnState::Write(working) => {
                *self.shared.committed.write() = Arc::new(working);
                self.release_writer();
                self.shared
                    .commits_since_checkpoint
                    .fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            other => {
                self.state = other;
                Err(EngineError::NoTransaction)
            }
        }
    }

    fn rollback_write(&mut self) -> EngineResult<()> {
        match std::mem::replace(&mut self.state, TxnState::Idle) {
            TxnState::Write(_) => {
                self.release_writer();
                Ok(())
            }
            other => {
                self.state = other;
                Err(EngineError::NoTransaction)
            }
        }
    }

    fn get(&mut self, key: &str) -> EngineResult<Option<Row>> {
        match &self.state {
            TxnState::Read(snapshot) => Ok(snapshot.rows.get(key).cloned()),
            TxnState::Write(working) => Ok(working.rows.get(key).cloned()),
            TxnState::Idle => Err(EngineError::NoTransaction),
        }
    }

    fn put(&mut self, key: &str, value: Vec<u8>, metadata: Option<Vec<u8>>) -> EngineResult<()> {
        match &mut self.state {
            TxnState::Write(working) => {
                working.rows.insert(key.to_owned(), Row::new(value, metadata));
                Ok(())
            }
            _ => Err(EngineError::NoTransaction),
        }
    }

    fn delete(&mut self, key: &str) -> EngineResult<()> {
        match &mut self.state {
            TxnState::Write(working) => {
                working.rows.remove(key);
                Ok(())
            }
            _ => Err(EngineError::NoTransaction),
        }
    }

    fn checkpoint(&mut self) -> EngineResult<()> {
        // No log to fold in memory; the counters keep scheduling observable.
        self.shared.checkpoint_count.fetch_add(1, Ordering::SeqCst);
        self.shared
            .commits_since_checkpoint
            .store(0, Ordering::SeqCst);
        Ok(())
    }

    fn kv_get(&mut self, key: &str) -> EngineResult<Option<Vec<u8>>> {
        match &self.state {
            TxnState::Read(snapshot) => Ok(snapshot.internal.get(key).cloned()),
            TxnState::Write(working) => Ok(working.internal.get(key).cloned()),
            TxnState::Idle => Ok(self.shared.committed.read().internal.get(key).cloned()),
        }
    }

    fn kv_put(&mut self, key: &str, value: &[u8]) -> EngineResult<()> {
        match &mut self.state {
            TxnState::Write(working) => {
                working.internal.insert(key.to_owned(), value.to_vec());
                Ok(())
            }
            TxnState::Read(_) => Err(EngineError::TransactionActive),
            TxnState::Idle => {
                let mut committed = self.shared.committed.write();
                let mut next = (**committed).clone();
                next.internal.insert(key.to_owned(), value.to_vec());
                *committed = Arc::new(next);
                Ok(())
            }
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        // A handle dropped mid-write rolls back.
        if matches!(self.state, TxnState::Write(_)) {
            self.release_writer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> MemoryEngine {
        MemoryEngine::new()
    }

    #[test]
    fn put_commit_get() {
        let eng = engine();
        let mut conn = eng.connect().unwrap();

        conn.begin_write().unwrap();
        conn.put("k1", vec![1, 2, 3], Some(vec![9])).unwrap();
        conn.commit_write().unwrap();

        conn.begin_read().unwrap();
        let row = conn.get("k1").unwrap().unwrap();
        assert_eq!(row.value, vec![1, 2, 3]);
        assert_eq!(row.metadata, Some(vec![9]));
        conn.end_read().unwrap();
    }

    #[test]
    fn read_snapshot_is_stable() {
        let eng = engine();
        let mut writer = eng.connect().unwrap();
        let mut reader = eng.connect().unwrap();

        writer.begin_write().unwrap();
        writer.put("k1", vec![1], None).unwrap();
        writer.commit_write().unwrap();

        reader.begin_read().unwrap();

        writer.begin_write().unwrap();
        writer.put("k1", vec![2], None).unwrap();
        writer.commit_write().unwrap();

        // The open snapshot still sees the old value.
        assert_eq!(reader.get("k1").unwrap().unwrap().value, vec![1]);
        reader.end_read().unwrap();

        // A new snapshot sees the new value.
        reader.begin_read().unwrap();
        assert_eq!(reader.get("k1").unwrap().unwrap().value, vec![2]);
        reader.end_read().unwrap();
    }

    #[test]
    fn uncommitted_writes_invisible_to_readers() {
        let eng = engine();
        let mut writer = eng.connect().unwrap();
        let mut reader = eng.connect().unwrap();

        writer.begin_write().unwrap();
        writer.put("k1", vec![1], None).unwrap();

        reader.begin_read().unwrap();
        assert!(reader.get("k1").unwrap().is_none());
        reader.end_read().unwrap();

        writer.commit_write().unwrap();
    }

    #[test]
    fn second_concurrent_writer_rejected() {
        let eng = engine();
        let mut a = eng.connect().unwrap();
        let mut b = eng.connect().unwrap();

        a.begin_write().unwrap();
        assert!(matches!(b.begin_write(), Err(EngineError::WriterActive)));
        assert_eq!(eng.active_writers(), 1);
        assert_eq!(eng.peak_writers(), 1);

        a.rollback_write().unwrap();
        b.begin_write().unwrap();
        b.rollback_write().unwrap();
    }

    #[test]
    fn rollback_discards_changes() {
        let eng = engine();
        let mut conn = eng.connect().unwrap();

        conn.begin_write().unwrap();
        conn.put("k1", vec![1], None).unwrap();
        conn.rollback_write().unwrap();

        conn.begin_read().unwrap();
        assert!(conn.get("k1").unwrap().is_none());
        conn.end_read().unwrap();
    }

    #[test]
    fn delete_absent_key_is_noop() {
        let eng = engine();
        let mut conn = eng.connect().unwrap();
        conn.begin_write().unwrap();
        conn.delete("missing").unwrap();
        conn.commit_write().unwrap();
    }

    #[test]
    fn kv_commits_atomically_with_rows() {
        let eng = engine();
        let mut writer = eng.connect().unwrap();
        let mut reader = eng.connect().unwrap();

        reader.begin_read().unwrap();

        writer.begin_write().unwrap();
        writer.put("k1", vec![1], None).unwrap();
        writer.kv_put("marker", &[7]).unwrap();
        writer.commit_write().unwrap();

        // The open snapshot predates the commit: neither row nor marker.
        assert!(reader.get("k1").unwrap().is_none());
        assert!(reader.kv_get("marker").unwrap().is_none());
        reader.end_read().unwrap();

        // A fresh snapshot sees both together.
        reader.begin_read().unwrap();
        assert!(reader.get("k1").unwrap().is_some());
        assert_eq!(reader.kv_get("marker").unwrap(), Some(vec![7]));
        reader.end_read().unwrap();
    }

    #[test]
    fn kv_outside_transaction_is_immediate() {
        let eng = engine();
        let mut a = eng.connect().unwrap();
        let mut b = eng.connect().unwrap();

        a.kv_put("version", &[1, 0]).unwrap();
        assert_eq!(b.kv_get("version").unwrap(), Some(vec![1, 0]));
    }

    #[test]
    fn kv_put_rejected_in_read_transaction() {
        let eng = engine();
        let mut conn = eng.connect().unwrap();
        conn.begin_read().unwrap();
        assert!(matches!(
            conn.kv_put("k", &[1]),
            Err(EngineError::TransactionActive)
        ));
        conn.end_read().unwrap();
    }

    #[test]
    fn checkpoint_counters() {
        let eng = engine();
        let mut conn = eng.connect().unwrap();

        conn.begin_write().unwrap();
        conn.put("k1", vec![1], None).unwrap();
        conn.commit_write().unwrap();
        assert_eq!(eng.commits_since_checkpoint(), 1);
        assert_eq!(eng.checkpoint_count(), 0);

        conn.checkpoint().unwrap();
        assert_eq!(eng.checkpoint_count(), 1);
        assert_eq!(eng.commits_since_checkpoint(), 0);
    }

    #[test]
    fn dropped_writer_releases_exclusivity() {
        let eng = engine();
        {
            let mut conn = eng.connect().unwrap();
            conn.begin_write().unwrap();
            conn.put("k1", vec![1], None).unwrap();
            // Dropped without commit.
        }
        assert_eq!(eng.active_writers(), 0);

        let mut conn = eng.connect().unwrap();
        conn.begin_write().unwrap();
        conn.commit_write().unwrap();

        // The dropped transaction's write never landed.
        conn.begin_read().unwrap();
        assert!(conn.get("k1").unwrap().is_none());
        conn.end_read().unwrap();
    }

    #[test]
    fn clone_shares_the_store() {
        let eng = engine();
        let mut conn = eng.connect().unwrap();
        conn.begin_write().unwrap();
        conn.put("k1", vec![1], None).unwrap();
        conn.commit_write().unwrap();

        let reopened = eng.clone();
        let mut conn2 = reopened.connect().unwrap();
        conn2.begin_read().unwrap();
        assert!(conn2.get("k1").unwrap().is_some());
        conn2.end_read().unwrap();
    }

    #[test]
    fn transaction_state_errors() {
        let eng = engine();
        let mut conn = eng.connect().unwrap();

        assert!(matches!(conn.get("k"), Err(EngineError::NoTransaction)));
        assert!(matches!(conn.end_read(), Err(EngineError::NoTransaction)));
        assert!(matches!(
            conn.commit_write(),
            Err(EngineError::NoTransaction)
        ));

        conn.begin_read().unwrap();
        assert!(matches!(
            conn.begin_write(),
            Err(EngineError::TransactionActive)
        ));
        conn.end_read().unwrap();
    }
}
