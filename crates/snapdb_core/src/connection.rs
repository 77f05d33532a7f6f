//! Connections: one engine handle plus a private serializing execution
//! context.
//!
//! Every operation on a connection runs on its dedicated worker thread,
//! which owns the engine handle outright. Synchronous calls enqueue a job
//! and block on a result channel; asynchronous calls enqueue the same job
//! and deliver the result through a caller-chosen notification context.
//! The queue gives strict FIFO ordering per connection, and the
//! coordinator's write gate orders writers database-wide.

use crate::cache::{CacheStats, CacheView, FlushLevel};
use crate::changeset::ChangesetBuilder;
use crate::checkpoint::CheckpointStrategy;
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::error::{CoreError, CoreResult};
use crate::notify::NotificationContext;
use crate::schema::LAST_WRITE_KEY;
use crate::transaction::{ReadTransaction, WriteTransaction};
use crate::types::{ConnectionId, WriteTimestamp};
use parking_lot::Mutex;
use snapdb_engine::{EngineConnection, EngineError};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

type Job = Box<dyn FnOnce(&mut ConnectionCore) + Send>;

/// Worker-side state: everything a transaction touches lives here, owned by
/// the connection's thread.
struct ConnectionCore {
    id: ConnectionId,
    engine: Box<dyn EngineConnection>,
    coordinator: Arc<Coordinator>,
    cache: Arc<Mutex<CacheView>>,
    checkpoint: CheckpointStrategy,
}

impl ConnectionCore {
    /// Catches the cache view up to the coordinator's current last write,
    /// merging any unseen changesets first.
    fn catch_up(&mut self) -> WriteTimestamp {
        let until = self.coordinator.last_write();
        let since = self.cache.lock().timestamp;
        if until > since {
            let changes = self.coordinator.changes_since(since, until);
            self.cache
                .lock()
                .merge(&changes, until, self.coordinator.classifier().as_ref());
        }
        until
    }

    fn run_read<R>(
        &mut self,
        body: impl FnOnce(&mut ReadTransaction<'_>) -> CoreResult<R>,
    ) -> CoreResult<R> {
        // Merge before opening the engine snapshot; the other order would
        // let a cache hit race ahead of the engine's visible state.
        self.catch_up();
        self.engine.begin_read()?;
        let result = self.snapshot_read(body);
        if let Err(error) = self.engine.end_read() {
            warn!(%error, "failed to close engine read");
            if result.is_ok() {
                return Err(error.into());
            }
        }
        result
    }

    /// Runs a read body inside the open engine snapshot, correcting for the
    /// race window first: the snapshot may contain a commit whose committed
    /// note has not landed yet. The persisted marker inside the snapshot
    /// names that commit, and the pending entry in the coordinator's log
    /// supplies its classification, so cache visibility never lags durable
    /// visibility.
    fn snapshot_read<R>(
        &mut self,
        body: impl FnOnce(&mut ReadTransaction<'_>) -> CoreResult<R>,
    ) -> CoreResult<R> {
        let view_ts = self.cache.lock().timestamp;
        if let Some(bytes) = self.engine.kv_get(LAST_WRITE_KEY)? {
            match WriteTimestamp::decode(&bytes) {
                Some(engine_ts) if engine_ts > view_ts => {
                    let changes = self.coordinator.changes_since(view_ts, engine_ts);
                    trace!(
                        connection = %self.id,
                        count = changes.len(),
                        "read raced a commit; merging ahead of the snapshot"
                    );
                    self.cache.lock().merge(
                        &changes,
                        engine_ts,
                        self.coordinator.classifier().as_ref(),
                    );
                }
                Some(_) => {}
                None => warn!("persisted last-write marker is malformed; ignoring"),
            }
        }

        let snapshot = self.cache.lock().timestamp;
        let mut txn = ReadTransaction::new(self.engine.as_mut(), &self.cache, snapshot);
        txn.begin();
        let out = body(&mut txn);
        txn.complete();
        out
    }

    fn run_write<R>(
        &mut self,
        body: impl FnOnce(&mut WriteTransaction<'_>) -> CoreResult<R>,
    ) -> CoreResult<R> {
        let coordinator = Arc::clone(&self.coordinator);
        let _gate = coordinator.lock_write();
        // Under the gate no other writer can advance last_write, so the
        // catch-up leaves the cache exactly at the engine's current state.
        let snapshot = self.catch_up();
        self.engine.begin_write()?;

        let mut builder = ChangesetBuilder::new();
        let body_result = {
            let mut txn =
                WriteTransaction::new(self.engine.as_mut(), &self.cache, &mut builder, snapshot);
            txn.begin();
            let out = body(&mut txn);
            txn.complete();
            out
        };

        let out = match body_result {
            Ok(out) => out,
            Err(error) => {
                if let Err(rollback_error) = self.engine.rollback_write() {
                    warn!(%rollback_error, "rollback after failed body also failed");
                }
                return Err(error);
            }
        };

        if builder.is_empty() {
            // Nothing changed: commit the engine transaction and skip the
            // changeset protocol entirely.
            self.engine.commit_write()?;
            return Ok(out);
        }

        let changeset = self.coordinator.note_pending(self.id, builder);
        let timestamp = changeset.timestamp();

        // The marker commits atomically with the data, so any snapshot
        // containing this commit also names its timestamp.
        if let Err(error) = self.engine.kv_put(LAST_WRITE_KEY, &timestamp.encode()) {
            self.coordinator.withdraw_pending(&changeset);
            if let Err(rollback_error) = self.engine.rollback_write() {
                warn!(%rollback_error, "rollback after failed marker write also failed");
            }
            return Err(error.into());
        }

        if let Err(error) = self.engine.commit_write() {
            // The engine rolled the transaction back itself.
            self.coordinator.withdraw_pending(&changeset);
            return Err(error.into());
        }

        self.coordinator.note_committed(&changeset);
        self.cache.lock().merge(
            std::slice::from_ref(&changeset),
            timestamp,
            self.coordinator.classifier().as_ref(),
        );

        match &self.checkpoint {
            CheckpointStrategy::Inline => {
                if let Err(error) = self.engine.checkpoint() {
                    warn!(%error, "inline checkpoint failed");
                }
            }
            CheckpointStrategy::Background(signal) => {
                let _ = signal.send(());
            }
        }

        debug!(
            connection = %self.id,
            timestamp = %timestamp,
            keys = changeset.len(),
            "committed write transaction"
        );
        Ok(out)
    }
}

/// One connection to the database.
///
/// A connection owns one engine handle and a private cache view, and
/// serializes all of its operations through a dedicated worker thread.
/// Connections are independent: reads on different connections proceed
/// concurrently; writes serialize database-wide through the coordinator.
///
/// Dropping the connection (or calling [`Connection::close`]) drains the
/// queued work, unregisters from the coordinator, and joins the worker.
pub struct Connection {
    id: ConnectionId,
    jobs: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    coordinator: Arc<Coordinator>,
    cache: Arc<Mutex<CacheView>>,
}

impl Connection {
    pub(crate) fn spawn(
        engine: Box<dyn EngineConnection>,
        coordinator: Arc<Coordinator>,
        config: &Config,
        checkpoint: CheckpointStrategy,
    ) -> CoreResult<Self> {
        let cache = Arc::new(Mutex::new(CacheView::new(config)));
        let id = coordinator.register(Arc::clone(&cache));

        let (jobs, queue) = mpsc::channel::<Job>();
        let worker_coordinator = Arc::clone(&coordinator);
        let worker_cache = Arc::clone(&cache);
        let worker = thread::Builder::new()
            .name(format!("snapdb-conn-{}", id.as_u64()))
            .spawn(move || {
                let mut core = ConnectionCore {
                    id,
                    engine,
                    coordinator: worker_coordinator,
                    cache: worker_cache,
                    checkpoint,
                };
                while let Ok(job) = queue.recv() {
                    job(&mut core);
                }
                trace!(connection = %id, "connection worker stopped");
            });

        let worker = match worker {
            Ok(worker) => worker,
            Err(error) => {
                coordinator.unregister(id);
                return Err(EngineError::Io(error).into());
            }
        };

        Ok(Self {
            id,
            jobs: Some(jobs),
            worker: Some(worker),
            coordinator,
            cache,
        })
    }

    /// Returns this connection's id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the snapshot up to which this connection's caches are known
    /// consistent.
    #[must_use]
    pub fn cache_timestamp(&self) -> WriteTimestamp {
        self.cache.lock().timestamp
    }

    /// Returns (object cache, metadata cache) counters.
    #[must_use]
    pub fn cache_stats(&self) -> (CacheStats, CacheStats) {
        let view = self.cache.lock();
        (view.objects.stats(), view.metadata.stats())
    }

    /// Drops cached rows to reclaim memory. Consistency is unaffected;
    /// dropped rows are refetched on next access.
    pub fn flush_cache(&self, level: FlushLevel) {
        self.cache.lock().flush(level);
    }

    /// Runs a read transaction, blocking until the body completes.
    ///
    /// # Errors
    ///
    /// Returns the body's error, an engine error, or
    /// [`CoreError::ConnectionClosed`] if the connection has shut down.
    pub fn read<F, R>(&self, body: F) -> CoreResult<R>
    where
        F: FnOnce(&mut ReadTransaction<'_>) -> CoreResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let (result_tx, result_rx) = mpsc::channel();
        self.enqueue(Box::new(move |core| {
            let _ = result_tx.send(core.run_read(body));
        }))?;
        result_rx.recv().map_err(|_| CoreError::ConnectionClosed)?
    }

    /// Runs a read-write transaction, blocking until the body and the full
    /// commit complete.
    ///
    /// # Errors
    ///
    /// Returns the body's error (the transaction rolls back), an engine
    /// error, or [`CoreError::ConnectionClosed`].
    pub fn read_write<F, R>(&self, body: F) -> CoreResult<R>
    where
        F: FnOnce(&mut WriteTransaction<'_>) -> CoreResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let (result_tx, result_rx) = mpsc::channel();
        self.enqueue(Box::new(move |core| {
            let _ = result_tx.send(core.run_write(body));
        }))?;
        result_rx.recv().map_err(|_| CoreError::ConnectionClosed)?
    }

    /// Runs a read transaction without blocking the caller. The body runs
    /// on this connection's worker in FIFO order with its other operations;
    /// the completion runs on `context`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConnectionClosed`] if the connection has shut
    /// down; all later errors reach the completion instead.
    pub fn read_async<F, R, C>(
        &self,
        body: F,
        completion: C,
        context: Arc<dyn NotificationContext>,
    ) -> CoreResult<()>
    where
        F: FnOnce(&mut ReadTransaction<'_>) -> CoreResult<R> + Send + 'static,
        R: Send + 'static,
        C: FnOnce(CoreResult<R>) + Send + 'static,
    {
        self.enqueue(Box::new(move |core| {
            let result = core.run_read(body);
            context.execute(Box::new(move || completion(result)));
        }))
    }

    /// Runs a read-write transaction without blocking the caller; the
    /// completion runs on `context` once the full commit has finished.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConnectionClosed`] if the connection has shut
    /// down; all later errors reach the completion instead.
    pub fn read_write_async<F, R, C>(
        &self,
        body: F,
        completion: C,
        context: Arc<dyn NotificationContext>,
    ) -> CoreResult<()>
    where
        F: FnOnce(&mut WriteTransaction<'_>) -> CoreResult<R> + Send + 'static,
        R: Send + 'static,
        C: FnOnce(CoreResult<R>) + Send + 'static,
    {
        self.enqueue(Box::new(move |core| {
            let result = core.run_write(body);
            context.execute(Box::new(move || completion(result)));
        }))
    }

    /// Closes the connection: drains queued work, joins the worker, and
    /// unregisters from the coordinator. Idempotent.
    pub fn close(&mut self) {
        if self.jobs.take().is_some() {
            debug!(connection = %self.id, "closing connection");
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
            self.coordinator.unregister(self.id);
        }
    }

    fn enqueue(&self, job: Job) -> CoreResult<()> {
        match &self.jobs {
            Some(jobs) => jobs.send(job).map_err(|_| CoreError::ConnectionClosed),
            None => Err(CoreError::ConnectionClosed),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::KeyMapClassifier;
    use crate::notify::InlineContext;
    use snapdb_engine::{MemoryEngine, StorageEngine};

    fn setup() -> (MemoryEngine, Arc<Coordinator>) {
        let engine = MemoryEngine::new();
        let coordinator = Arc::new(Coordinator::new(
            WriteTimestamp::ZERO,
            Arc::new(KeyMapClassifier),
        ));
        (engine, coordinator)
    }

    fn connect(engine: &MemoryEngine, coordinator: &Arc<Coordinator>) -> Connection {
        Connection::spawn(
            engine.connect().unwrap(),
            Arc::clone(coordinator),
            &Config::default(),
            CheckpointStrategy::Inline,
        )
        .unwrap()
    }

    #[test]
    fn write_then_read_on_same_connection() {
        let (engine, coordinator) = setup();
        let conn = connect(&engine, &coordinator);

        conn.read_write(|txn| txn.put("k1", vec![1, 2], Some(vec![9])))
            .unwrap();

        let value = conn.read(|txn| txn.get("k1")).unwrap().unwrap();
        assert_eq!(value.as_slice(), &[1, 2]);
        let metadata = conn.read(|txn| txn.get_metadata("k1")).unwrap().unwrap();
        assert_eq!(metadata.as_slice(), &[9]);
    }

    #[test]
    fn second_read_hits_the_cache() {
        let (engine, coordinator) = setup();
        let conn = connect(&engine, &coordinator);

        conn.read_write(|txn| txn.put("k1", vec![1], None)).unwrap();
        conn.read(|txn| txn.get("k1")).unwrap();
        let (objects_before, _) = conn.cache_stats();
        conn.read(|txn| txn.get("k1")).unwrap();
        let (objects_after, _) = conn.cache_stats();

        assert_eq!(objects_after.hits, objects_before.hits + 1);
    }

    #[test]
    fn commit_fans_out_to_other_connection() {
        let (engine, coordinator) = setup();
        let a = connect(&engine, &coordinator);
        let b = connect(&engine, &coordinator);

        a.read_write(|txn| txn.put("k1", vec![1], None)).unwrap();
        assert_eq!(
            b.read(|txn| txn.get("k1")).unwrap().unwrap().as_slice(),
            &[1]
        );

        // B now holds k1 in cache; A's update must displace it.
        a.read_write(|txn| txn.put("k1", vec![2], None)).unwrap();
        assert_eq!(
            b.read(|txn| txn.get("k1")).unwrap().unwrap().as_slice(),
            &[2]
        );
    }

    #[test]
    fn read_during_pending_commit_window_sees_the_write() {
        let (engine, coordinator) = setup();
        let a = connect(&engine, &coordinator);
        let b = connect(&engine, &coordinator);

        a.read_write(|txn| txn.put("k1", vec![1], None)).unwrap();
        // Warm B's cache with the soon-to-be-deleted row.
        assert!(b.read(|txn| txn.get("k1")).unwrap().is_some());

        // A writer has registered its pending delete and durably committed,
        // but its committed note has not landed yet.
        let mut builder = ChangesetBuilder::new();
        builder.record_deleted("k1");
        let changeset = coordinator.note_pending(ConnectionId::new(999), builder);
        let mut handle = engine.connect().unwrap();
        handle.begin_write().unwrap();
        handle.delete("k1").unwrap();
        handle
            .kv_put(LAST_WRITE_KEY, &changeset.timestamp().encode())
            .unwrap();
        handle.commit_write().unwrap();

        // B's read starts inside the window: the catch-up merge sees
        // nothing new, but the snapshot's marker pulls in the pending
        // changeset, so the cached row must not be served.
        assert!(b.read(|txn| txn.get("k1")).unwrap().is_none());
        assert_eq!(b.cache_timestamp(), changeset.timestamp());

        coordinator.note_committed(&changeset);
    }

    #[test]
    fn body_error_rolls_back() {
        let (engine, coordinator) = setup();
        let conn = connect(&engine, &coordinator);

        let result: CoreResult<()> = conn.read_write(|txn| {
            txn.put("k1", vec![1], None)?;
            Err(CoreError::invalid_operation("caller changed its mind"))
        });
        assert!(result.is_err());

        assert!(conn.read(|txn| txn.get("k1")).unwrap().is_none());
        assert_eq!(coordinator.last_write(), WriteTimestamp::ZERO);
    }

    #[test]
    fn empty_write_skips_the_changeset_protocol() {
        let (engine, coordinator) = setup();
        let conn = connect(&engine, &coordinator);

        conn.read_write(|txn| txn.get("missing")).unwrap();
        assert_eq!(coordinator.last_write(), WriteTimestamp::ZERO);
    }

    #[test]
    fn async_operations_preserve_fifo_order() {
        let (engine, coordinator) = setup();
        let conn = connect(&engine, &coordinator);
        let (tx, rx) = mpsc::channel();

        let tx_write = tx.clone();
        conn.read_write_async(
            |txn| txn.put("k1", vec![5], None),
            move |result| tx_write.send(("write", result.is_ok())).unwrap(),
            Arc::new(InlineContext),
        )
        .unwrap();

        conn.read_async(
            |txn| Ok(txn.get("k1")?.map(|v| v.as_slice().to_vec())),
            move |result| {
                let value = result.unwrap();
                tx.send(("read", value == Some(vec![5]))).unwrap();
            },
            Arc::new(InlineContext),
        )
        .unwrap();

        // The queued read runs after the queued write and sees its value.
        assert_eq!(rx.recv().unwrap(), ("write", true));
        assert_eq!(rx.recv().unwrap(), ("read", true));
    }

    #[test]
    fn cache_timestamp_is_non_decreasing_across_reads() {
        let (engine, coordinator) = setup();
        let a = connect(&engine, &coordinator);
        let b = connect(&engine, &coordinator);

        let mut prev = b.cache_timestamp();
        for i in 0..10u8 {
            a.read_write(move |txn| txn.put("k", vec![i], None)).unwrap();
            b.read(|txn| txn.get("k")).unwrap();
            let now = b.cache_timestamp();
            assert!(now >= prev);
            prev = now;
        }
    }

    #[test]
    fn flush_cache_drops_rows_but_not_consistency() {
        let (engine, coordinator) = setup();
        let conn = connect(&engine, &coordinator);

        conn.read_write(|txn| txn.put("k1", vec![1], None)).unwrap();
        conn.read(|txn| txn.get("k1")).unwrap();
        let ts = conn.cache_timestamp();

        conn.flush_cache(FlushLevel::Full);
        let (objects, _) = conn.cache_stats();
        assert_eq!(objects.len, 0);
        assert_eq!(conn.cache_timestamp(), ts);

        assert!(conn.read(|txn| txn.get("k1")).unwrap().is_some());
    }

    #[test]
    fn closed_connection_rejects_work() {
        let (engine, coordinator) = setup();
        let mut conn = connect(&engine, &coordinator);
        assert_eq!(coordinator.connection_count(), 1);

        conn.close();
        assert_eq!(coordinator.connection_count(), 0);
        assert!(matches!(
            conn.read(|txn| txn.get("k1")),
            Err(CoreError::ConnectionClosed)
        ));
    }
}
