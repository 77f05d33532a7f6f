//! Database configuration.

/// When the engine's log checkpoint runs.
///
/// Fixed at startup; not switchable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointMode {
    /// Run the checkpoint inline during each write commit. Writes complete
    /// slower, the engine log stays slim.
    #[default]
    Inline,
    /// Defer checkpoints to a dedicated low-priority background task.
    /// Writes complete faster, the log may grow larger between runs.
    Background,
}

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity of each connection's object cache, in rows.
    pub object_cache_capacity: usize,

    /// Capacity of each connection's metadata cache, in rows.
    pub metadata_cache_capacity: usize,

    /// Checkpoint scheduling policy.
    pub checkpoint: CheckpointMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            object_cache_capacity: 250,
            metadata_cache_capacity: 500,
            checkpoint: CheckpointMode::Inline,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-connection object cache capacity.
    #[must_use]
    pub const fn object_cache_capacity(mut self, rows: usize) -> Self {
        self.object_cache_capacity = rows;
        self
    }

    /// Sets the per-connection metadata cache capacity.
    #[must_use]
    pub const fn metadata_cache_capacity(mut self, rows: usize) -> Self {
        self.metadata_cache_capacity = rows;
        self
    }

    /// Sets the checkpoint scheduling policy.
    #[must_use]
    pub const fn checkpoint(mut self, mode: CheckpointMode) -> Self {
        self.checkpoint = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.object_cache_capacity, 250);
        assert_eq!(config.metadata_cache_capacity, 500);
        assert_eq!(config.checkpoint, CheckpointMode::Inline);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .object_cache_capacity(10)
            .metadata_cache_capacity(20)
            .checkpoint(CheckpointMode::Background);

        assert_eq!(config.object_cache_capacity, 10);
        assert_eq!(config.metadata_cache_capacity, 20);
        assert_eq!(config.checkpoint, CheckpointMode::Background);
    }
}
