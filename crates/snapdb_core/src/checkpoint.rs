//! Checkpoint scheduling.
//!
//! Two strategies, fixed at startup: run the engine checkpoint inline on
//! the write path after each commit, or wake a dedicated background task.
//! The background task owns its own engine handle and never blocks writers
//! or readers; it shares nothing with the write path beyond the engine's
//! own atomic counters.

use crate::error::CoreResult;
use snapdb_engine::{EngineConnection, EngineError};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// How a connection's write path triggers checkpoints.
#[derive(Clone)]
pub(crate) enum CheckpointStrategy {
    /// Checkpoint inline during each commit, before releasing the write
    /// gate.
    Inline,
    /// Wake the background checkpointer; the send never blocks.
    Background(mpsc::Sender<()>),
}

/// Background checkpoint task.
///
/// Wakeups are coalesced: a burst of commits produces one checkpoint run.
pub(crate) struct Checkpointer {
    signal: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Checkpointer {
    /// Spawns the checkpoint thread on its own engine handle.
    pub(crate) fn spawn(mut engine: Box<dyn EngineConnection>) -> CoreResult<Self> {
        let (signal, wakeups) = mpsc::channel::<()>();
        let worker = thread::Builder::new()
            .name("snapdb-checkpoint".to_owned())
            .spawn(move || {
                while wakeups.recv().is_ok() {
                    // Coalesce wakeups queued while we were running.
                    while wakeups.try_recv().is_ok() {}
                    match engine.checkpoint() {
                        Ok(()) => debug!("background checkpoint complete"),
                        Err(error) => warn!(%error, "background checkpoint failed"),
                    }
                }
            })
            .map_err(EngineError::Io)?;

        Ok(Self {
            signal: Some(signal),
            worker: Some(worker),
        })
    }

    /// Returns the write-path strategy handle for this checkpointer.
    pub(crate) fn strategy(&self) -> CheckpointStrategy {
        match &self.signal {
            Some(signal) => CheckpointStrategy::Background(signal.clone()),
            None => CheckpointStrategy::Inline,
        }
    }

    /// Stops the checkpoint thread. Idempotent.
    pub(crate) fn stop(&mut self) {
        self.signal.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        self.stop();
    }
}
