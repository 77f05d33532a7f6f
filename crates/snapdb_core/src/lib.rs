//! # snapdb core
//!
//! Multi-connection, snapshot-coherent access to an embedded
//! single-writer/multi-reader storage engine.
//!
//! The engine provides ACID transactions; this crate adds the consistency
//! and caching layer above it:
//! - One global write gate: at most one write transaction database-wide
//! - Per-connection decoded-row caches with bounded LRU eviction
//! - A pending/committed changeset protocol that keeps every connection's
//!   cache at least as new as its engine-level snapshot, even when a read
//!   races a concurrent writer's commit
//! - Synchronous and asynchronous transaction forms with per-connection
//!   FIFO ordering
//!
//! ## Quick Start
//!
//! ```rust
//! use snapdb_core::{Database, KeyValueSchema};
//!
//! let db = Database::open_in_memory(&KeyValueSchema).unwrap();
//! let conn = db.connection().unwrap();
//!
//! conn.read_write(|txn| txn.put("greeting", b"hello".to_vec(), None))
//!     .unwrap();
//! let value = conn.read(|txn| txn.get("greeting")).unwrap().unwrap();
//! assert_eq!(value.as_slice(), b"hello");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod changeset;
mod checkpoint;
mod config;
mod connection;
mod coordinator;
mod database;
mod error;
mod notify;
mod schema;
mod transaction;
mod types;

pub use cache::{CacheStats, FlushLevel, LruCache};
pub use changeset::{Changeset, ChangesetBuilder, ChangesetClassifier, KeyChange, KeyMapClassifier};
pub use config::{CheckpointMode, Config};
pub use connection::Connection;
pub use database::Database;
pub use error::{CoreError, CoreResult};
pub use notify::{InlineContext, NotificationContext, SpawnContext};
pub use schema::{KeyValueSchema, SchemaDelegate};
pub use transaction::{ReadTransaction, WriteTransaction};
pub use types::{ConnectionId, WriteTimestamp};

pub use snapdb_engine::{EngineConnection, EngineError, MemoryEngine, Row, StorageEngine};
