//! The coordinator: global write exclusivity, the metadata gate, the
//! connection registry, and the pending/committed changeset log.
//!
//! Lock order: the metadata gate is always acquired before any connection's
//! cache-view lock, and no coordinator call runs engine I/O. Critical
//! sections are O(number of touched keys).

use crate::cache::CacheView;
use crate::changeset::{Changeset, ChangesetBuilder, ChangesetClassifier};
use crate::types::{ConnectionId, WriteTimestamp};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// Monotonic tick source, unaffected by wall-clock changes. Seeded from the
/// persisted last-write marker so ticks keep growing across restarts.
#[derive(Debug)]
struct TickClock {
    origin: Instant,
    base: u64,
}

impl TickClock {
    fn new(base: u64) -> Self {
        Self {
            origin: Instant::now(),
            base,
        }
    }

    fn ticks(&self) -> u64 {
        self.base
            .saturating_add(u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX))
    }
}

/// One registered connection: its id plus the fan-out handle to its cache
/// view.
struct Registered {
    id: ConnectionId,
    cache: Arc<Mutex<CacheView>>,
}

/// A changeset in the retained log. Pending until its durable commit is
/// confirmed.
struct Retained {
    changeset: Arc<Changeset>,
    committed: bool,
}

/// State behind the metadata gate.
struct Meta {
    last_write: WriteTimestamp,
    next_seq: u64,
    changesets: Vec<Retained>,
    connections: Vec<Registered>,
    next_connection_id: u64,
}

/// Coordinates one database's connections.
///
/// Owns the registry and the changeset log exclusively; all access funnels
/// through the metadata gate. The write gate serializes write transactions
/// database-wide.
pub(crate) struct Coordinator {
    write_gate: Mutex<()>,
    meta: Mutex<Meta>,
    clock: TickClock,
    classifier: Arc<dyn ChangesetClassifier>,
}

impl Coordinator {
    /// Creates a coordinator seeded from the persisted last-write marker.
    pub(crate) fn new(seed: WriteTimestamp, classifier: Arc<dyn ChangesetClassifier>) -> Self {
        Self {
            write_gate: Mutex::new(()),
            meta: Mutex::new(Meta {
                last_write: seed,
                next_seq: seed.seq() + 1,
                changesets: Vec::new(),
                connections: Vec::new(),
                next_connection_id: 1,
            }),
            clock: TickClock::new(seed.ticks()),
            classifier,
        }
    }

    /// Returns the changeset classifier.
    pub(crate) fn classifier(&self) -> &Arc<dyn ChangesetClassifier> {
        &self.classifier
    }

    /// Acquires the global write gate: at most one write transaction
    /// database-wide while the guard lives.
    pub(crate) fn lock_write(&self) -> MutexGuard<'_, ()> {
        self.write_gate.lock()
    }

    /// Returns the timestamp of the most recent committed write.
    pub(crate) fn last_write(&self) -> WriteTimestamp {
        self.meta.lock().last_write
    }

    /// Registers a connection's cache view and assigns its id. The empty
    /// cache is trivially consistent with the current state, so its
    /// timestamp starts at `last_write`.
    pub(crate) fn register(&self, cache: Arc<Mutex<CacheView>>) -> ConnectionId {
        let mut meta = self.meta.lock();
        let id = ConnectionId::new(meta.next_connection_id);
        meta.next_connection_id += 1;
        cache.lock().timestamp = meta.last_write;
        meta.connections.push(Registered { id, cache });
        debug!(connection = %id, "registered connection");
        id
    }

    /// Removes a connection from the registry.
    pub(crate) fn unregister(&self, id: ConnectionId) {
        let mut meta = self.meta.lock();
        meta.connections.retain(|registered| registered.id != id);
        debug!(connection = %id, "unregistered connection");
        Self::prune(&mut meta);
    }

    /// Returns the number of live connections.
    pub(crate) fn connection_count(&self) -> usize {
        self.meta.lock().connections.len()
    }

    /// Registers a changeset as pending, strictly before its durable
    /// commit. Assigns the commit timestamp and makes the changeset visible
    /// to [`Coordinator::changes_since`] immediately, without advancing
    /// `last_write`.
    pub(crate) fn note_pending(
        &self,
        origin: ConnectionId,
        builder: ChangesetBuilder,
    ) -> Arc<Changeset> {
        let mut meta = self.meta.lock();
        let ticks = self.clock.ticks().max(meta.last_write.ticks());
        let timestamp = WriteTimestamp::new(ticks, meta.next_seq);
        meta.next_seq += 1;

        let changeset = Arc::new(builder.freeze(timestamp, origin));
        meta.changesets.push(Retained {
            changeset: Arc::clone(&changeset),
            committed: false,
        });
        trace!(timestamp = %timestamp, keys = changeset.len(), "noted pending changes");
        changeset
    }

    /// Confirms a changeset's durable commit: advances `last_write`, marks
    /// the log entry committed, and synchronously merges the changeset into
    /// every other live connection's cache view.
    ///
    /// # Panics
    ///
    /// Panics if the changeset was never registered as pending, or was
    /// already committed: either means the snapshot protocol is broken.
    pub(crate) fn note_committed(&self, changeset: &Arc<Changeset>) {
        let timestamp = changeset.timestamp();
        let mut meta = self.meta.lock();

        let entry = meta
            .changesets
            .iter_mut()
            .find(|retained| retained.changeset.timestamp() == timestamp)
            .unwrap_or_else(|| {
                panic!("changeset {timestamp} committed without a pending registration")
            });
        assert!(
            !entry.committed,
            "changeset {timestamp} committed twice"
        );
        entry.committed = true;

        assert!(
            timestamp > meta.last_write,
            "commit timestamp {timestamp} not after last write {}",
            meta.last_write
        );
        meta.last_write = timestamp;

        let origin = changeset.origin();
        let mut notified = 0usize;
        for registered in &meta.connections {
            if registered.id == origin {
                continue;
            }
            registered.cache.lock().merge(
                std::slice::from_ref(changeset),
                timestamp,
                self.classifier.as_ref(),
            );
            notified += 1;
        }
        debug!(
            timestamp = %timestamp,
            keys = changeset.len(),
            notified,
            "noted committed changes"
        );
        Self::prune(&mut meta);
    }

    /// Withdraws a pending changeset whose durable commit failed, so
    /// readers stop merging a changeset that never became durable.
    ///
    /// # Panics
    ///
    /// Panics if the changeset is not pending in the log.
    pub(crate) fn withdraw_pending(&self, changeset: &Arc<Changeset>) {
        let timestamp = changeset.timestamp();
        let mut meta = self.meta.lock();
        let before = meta.changesets.len();
        meta.changesets
            .retain(|retained| retained.committed || retained.changeset.timestamp() != timestamp);
        assert_eq!(
            meta.changesets.len(),
            before - 1,
            "withdrawn changeset {timestamp} was not pending"
        );
        debug!(timestamp = %timestamp, "withdrew pending changes");
    }

    /// Returns all changesets, pending or committed, with timestamp in
    /// `(since, until]`, ordered by timestamp.
    pub(crate) fn changes_since(
        &self,
        since: WriteTimestamp,
        until: WriteTimestamp,
    ) -> Vec<Arc<Changeset>> {
        let meta = self.meta.lock();
        meta.changesets
            .iter()
            .filter(|retained| {
                let ts = retained.changeset.timestamp();
                ts > since && ts <= until
            })
            .map(|retained| Arc::clone(&retained.changeset))
            .collect()
    }

    /// Drops committed changesets every live connection has already seen.
    /// With no live connections the whole committed log is prunable.
    fn prune(meta: &mut Meta) {
        let min_seen = meta
            .connections
            .iter()
            .map(|registered| registered.cache.lock().timestamp)
            .min();
        let before = meta.changesets.len();
        match min_seen {
            Some(min) => meta
                .changesets
                .retain(|retained| !retained.committed || retained.changeset.timestamp() > min),
            None => meta.changesets.retain(|retained| !retained.committed),
        }
        let pruned = before - meta.changesets.len();
        if pruned > 0 {
            trace!(pruned, retained = meta.changesets.len(), "pruned changeset log");
        }
    }

    /// Number of retained changesets, for tests and diagnostics.
    #[cfg(test)]
    pub(crate) fn retained_len(&self) -> usize {
        self.meta.lock().changesets.len()
    }
}
