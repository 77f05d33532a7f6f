//! Database facade and startup.

use crate::checkpoint::{Checkpointer, CheckpointStrategy};
use crate::config::{CheckpointMode, Config};
use crate::connection::Connection;
use crate::coordinator::Coordinator;
use crate::error::{CoreError, CoreResult};
use crate::schema::{SchemaDelegate, LAST_WRITE_KEY, SCHEMA_VERSION_KEY};
use crate::types::WriteTimestamp;
use parking_lot::{Mutex, RwLock};
use snapdb_engine::{EngineError, MemoryEngine, StorageEngine};
use std::sync::Arc;
use tracing::debug;

/// The main database handle.
///
/// A `Database` wraps one storage engine with the coordination layer:
/// a global single-writer gate, a changeset log, and per-connection caches
/// kept coherent across commits. Exactly one `Database` exists per opened
/// store.
///
/// # Opening a Database
///
/// ```rust,ignore
/// use snapdb_core::{Database, KeyValueSchema};
///
/// let db = Database::open_in_memory(&KeyValueSchema)?;
/// let conn = db.connection()?;
///
/// conn.read_write(|txn| txn.put("user:1", b"alice".to_vec(), None))?;
/// let value = conn.read(|txn| txn.get("user:1"))?;
/// ```
///
/// Connections are independent; open one per thread of work. Reads on
/// different connections run concurrently, writes serialize database-wide.
pub struct Database {
    engine: Arc<dyn StorageEngine>,
    coordinator: Arc<Coordinator>,
    config: Config,
    checkpointer: Mutex<Option<Checkpointer>>,
    is_open: RwLock<bool>,
}

impl Database {
    /// Opens a database on the given engine.
    ///
    /// Startup order: the schema delegate creates its tables and the
    /// persisted schema version is checked (older stores are migrated
    /// forward, newer stores are refused), then the persisted last-write
    /// marker seeds the coordinator, and the background checkpointer starts
    /// if configured. Only then can connections be minted.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be reached, schema setup or
    /// migration fails, or the store's schema version is newer than the
    /// delegate supports.
    pub fn open(
        engine: Arc<dyn StorageEngine>,
        schema: &dyn SchemaDelegate,
        config: Config,
    ) -> CoreResult<Self> {
        let mut setup = engine.connect()?;
        schema.create_tables(setup.as_mut())?;

        let supported = schema.schema_version();
        let persisted = match setup.kv_get(SCHEMA_VERSION_KEY)? {
            None => None,
            Some(bytes) => match <[u8; 4]>::try_from(bytes.as_slice()) {
                Ok(raw) => Some(u32::from_le_bytes(raw)),
                Err(_) => {
                    return Err(EngineError::corrupt("malformed schema version").into());
                }
            },
        };
        match persisted {
            None => setup.kv_put(SCHEMA_VERSION_KEY, &supported.to_le_bytes())?,
            Some(version) if version < supported => {
                debug!(from = version, to = supported, "migrating schema");
                schema.migrate(setup.as_mut(), version)?;
                setup.kv_put(SCHEMA_VERSION_KEY, &supported.to_le_bytes())?;
            }
            Some(version) if version > supported => {
                return Err(CoreError::SchemaVersionTooNew {
                    persisted: version,
                    supported,
                });
            }
            Some(_) => {}
        }

        let seed = setup
            .kv_get(LAST_WRITE_KEY)?
            .and_then(|bytes| WriteTimestamp::decode(&bytes))
            .unwrap_or(WriteTimestamp::ZERO);
        let coordinator = Arc::new(Coordinator::new(seed, schema.classifier()));

        let checkpointer = match config.checkpoint {
            CheckpointMode::Inline => None,
            CheckpointMode::Background => Some(Checkpointer::spawn(engine.connect()?)?),
        };

        debug!(last_write = %seed, checkpoint = ?config.checkpoint, "opened database");
        Ok(Self {
            engine,
            coordinator,
            config,
            checkpointer: Mutex::new(checkpointer),
            is_open: RwLock::new(true),
        })
    }

    /// Opens a fresh in-memory database. Data is lost when the engine is
    /// dropped; intended for tests and ephemeral state.
    ///
    /// # Errors
    ///
    /// Returns an error if schema setup fails.
    pub fn open_in_memory(schema: &dyn SchemaDelegate) -> CoreResult<Self> {
        Self::open(Arc::new(MemoryEngine::new()), schema, Config::default())
    }

    /// Opens a new connection, registered with the coordinator.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is closed or the engine refuses
    /// another handle.
    pub fn connection(&self) -> CoreResult<Connection> {
        self.ensure_open()?;
        let handle = self.engine.connect()?;
        let strategy = match &*self.checkpointer.lock() {
            Some(checkpointer) => checkpointer.strategy(),
            None => CheckpointStrategy::Inline,
        };
        Connection::spawn(handle, Arc::clone(&self.coordinator), &self.config, strategy)
    }

    /// Returns the timestamp of the most recent committed write.
    #[must_use]
    pub fn last_write_timestamp(&self) -> WriteTimestamp {
        self.coordinator.last_write()
    }

    /// Returns the number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.coordinator.connection_count()
    }

    /// Runs a synchronous engine checkpoint on a dedicated handle,
    /// regardless of the configured scheduling policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is closed or the checkpoint fails.
    pub fn checkpoint_now(&self) -> CoreResult<()> {
        self.ensure_open()?;
        let mut handle = self.engine.connect()?;
        handle.checkpoint()?;
        Ok(())
    }

    /// Closes the database: stops the background checkpointer and refuses
    /// new connections. Existing connections keep working until closed
    /// themselves. Idempotent.
    pub fn close(&self) {
        let mut is_open = self.is_open.write();
        if !*is_open {
            return;
        }
        if let Some(mut checkpointer) = self.checkpointer.lock().take() {
            checkpointer.stop();
        }
        *is_open = false;
        debug!("closed database");
    }

    /// Checks if the database is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.is_open.read()
    }

    /// Returns the database configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if *self.is_open.read() {
            Ok(())
        } else {
            Err(CoreError::DatabaseClosed)
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("is_open", &self.is_open())
            .field("last_write", &self.last_write_timestamp())
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.close();
    }
}
