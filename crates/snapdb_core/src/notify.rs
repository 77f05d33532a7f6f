//! Notification contexts: where asynchronous completions run.

/// An execution context for delivering asynchronous completion callbacks.
///
/// Callers of the asynchronous transaction forms choose the context their
/// completion runs on, keeping the connection's worker free of caller code
/// beyond the transaction body itself.
pub trait NotificationContext: Send + Sync {
    /// Schedules a callback to run on this context.
    fn execute(&self, job: Box<dyn FnOnce() + Send>);
}

/// Runs each completion on a freshly spawned thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpawnContext;

impl NotificationContext for SpawnContext {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        std::thread::spawn(job);
    }
}

/// Runs completions inline on the connection worker, immediately after the
/// transaction finishes. Completions must be short: the connection performs
/// no further work until they return.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineContext;

impl NotificationContext for InlineContext {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        job();
    }
}
