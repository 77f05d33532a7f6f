//! Schema delegate: the seam for table creation, versioning, and the
//! changeset classifier hook.
//!
//! The delegate runs once at startup, before the coordination core
//! activates. Versioning is forward-only: a store whose persisted version
//! is newer than the delegate supports is refused rather than downgraded.

use crate::changeset::{ChangesetClassifier, KeyMapClassifier};
use crate::error::CoreResult;
use snapdb_engine::EngineConnection;
use std::sync::Arc;

/// Reserved internal key holding the persisted last-write marker.
pub(crate) const LAST_WRITE_KEY: &str = "snapdb.last_write";

/// Reserved internal key holding the persisted schema version.
pub(crate) const SCHEMA_VERSION_KEY: &str = "snapdb.schema_version";

/// Startup collaborator supplying schema setup and the changeset
/// classifier.
pub trait SchemaDelegate: Send + Sync {
    /// The schema version this delegate produces.
    fn schema_version(&self) -> u32;

    /// Creates the tables the schema requires. Runs on every open, so it
    /// must be idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if table creation fails; the open is aborted.
    fn create_tables(&self, engine: &mut dyn EngineConnection) -> CoreResult<()>;

    /// Migrates a store persisted at an older schema version. The default
    /// accepts any older version unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the migration fails; the open is aborted.
    fn migrate(&self, engine: &mut dyn EngineConnection, from_version: u32) -> CoreResult<()> {
        let _ = (engine, from_version);
        Ok(())
    }

    /// Returns the classifier used to interpret changesets during cache
    /// merges.
    fn classifier(&self) -> Arc<dyn ChangesetClassifier> {
        Arc::new(KeyMapClassifier)
    }
}

/// Minimal delegate for plain key-value rows: version 1, nothing to create,
/// default key-map classifier.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyValueSchema;

impl SchemaDelegate for KeyValueSchema {
    fn schema_version(&self) -> u32 {
        1
    }

    fn create_tables(&self, _engine: &mut dyn EngineConnection) -> CoreResult<()> {
        Ok(())
    }
}
