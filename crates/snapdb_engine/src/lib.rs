//! # snapdb engine
//!
//! Storage engine interface and reference implementation for snapdb.
//!
//! This crate defines the engine contract the snapdb coordination layer
//! consumes: an embedded ACID store with single-writer/multi-reader
//! transactions, a log checkpoint operation, and a reserved internal
//! key-value area for persisted markers.
//!
//! ## Design Principles
//!
//! - Engines store **opaque byte rows**; all decoding lives above them
//! - One write transaction engine-wide at any instant, engine-enforced
//! - Read transactions pin immutable snapshots of committed state
//! - The internal key-value area commits atomically with row data
//!
//! ## Available Engines
//!
//! - [`MemoryEngine`] - Copy-on-write in-memory engine for tests and
//!   ephemeral databases

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod engine;
mod error;
mod memory;

pub use engine::{EngineConnection, Row, StorageEngine};
pub use error::{EngineError, EngineResult};
pub use memory::{MemoryConnection, MemoryEngine};
