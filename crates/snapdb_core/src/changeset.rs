//! Changesets: immutable per-commit records of what a write altered.
//!
//! A changeset carries a per-key classification, never the written values.
//! Invalidation is pull-based: a modified key is evicted from caches and
//! lazily refetched on next access, so large payloads are never duplicated
//! into the coordination layer.

use crate::types::{ConnectionId, WriteTimestamp};
use std::collections::HashMap;

/// Classification of one key within a changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyChange {
    /// The key's row was not altered.
    Unchanged,
    /// The key's row was deleted.
    Deleted,
    /// The key's row was inserted or updated.
    Modified,
}

/// An immutable record of what one committed write transaction altered,
/// tagged with its commit timestamp.
///
/// Produced exactly once per committed write transaction; never mutated
/// after creation.
#[derive(Debug)]
pub struct Changeset {
    timestamp: WriteTimestamp,
    origin: ConnectionId,
    changes: HashMap<String, KeyChange>,
}

impl Changeset {
    /// Returns the commit timestamp.
    #[must_use]
    pub fn timestamp(&self) -> WriteTimestamp {
        self.timestamp
    }

    /// Returns the connection that produced this changeset.
    #[must_use]
    pub fn origin(&self) -> ConnectionId {
        self.origin
    }

    /// Iterates over the keys this changeset touched.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.changes.keys().map(String::as_str)
    }

    /// Returns the recorded classification for a key, if the key appears
    /// in this changeset.
    #[must_use]
    pub fn change_for(&self, key: &str) -> Option<KeyChange> {
        self.changes.get(key).copied()
    }

    /// Returns the number of touched keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Returns `true` if no keys were touched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Accumulates per-key classifications as a write transaction executes,
/// then freezes into an immutable [`Changeset`] at commit time.
#[derive(Debug, Default)]
pub struct ChangesetBuilder {
    changes: HashMap<String, KeyChange>,
}

impl ChangesetBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that a key was inserted or updated. A later modification
    /// supersedes an earlier deletion of the same key.
    pub fn record_modified(&mut self, key: &str) {
        self.changes.insert(key.to_owned(), KeyChange::Modified);
    }

    /// Records that a key was deleted. A later deletion supersedes an
    /// earlier modification of the same key.
    pub fn record_deleted(&mut self, key: &str) {
        self.changes.insert(key.to_owned(), KeyChange::Deleted);
    }

    /// Returns `true` if the transaction this builder belongs to touched
    /// a given key.
    #[must_use]
    pub fn touched(&self, key: &str) -> bool {
        self.changes.contains_key(key)
    }

    /// Returns `true` if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Freezes the accumulated changes into an immutable changeset.
    #[must_use]
    pub fn freeze(self, timestamp: WriteTimestamp, origin: ConnectionId) -> Changeset {
        Changeset {
            timestamp,
            origin,
            changes: self.changes,
        }
    }
}

/// Schema-supplied hook mapping a changeset to per-key classifications.
///
/// The coordination core treats the hook as opaque; a schema layer can
/// override it to interpret richer changeset shapes. An implementation that
/// cannot interpret a key must classify it as [`KeyChange::Modified`]: that
/// evicts the key, trading cache efficiency for correctness rather than
/// ever serving unverified stale data.
pub trait ChangesetClassifier: Send + Sync {
    /// Classifies one key of a changeset.
    fn classify(&self, changeset: &Changeset, key: &str) -> KeyChange;
}

/// Default classifier: reads the changeset's own key map. Keys the map does
/// not answer for are treated as modified, which evicts them.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyMapClassifier;

impl ChangesetClassifier for KeyMapClassifier {
    fn classify(&self, changeset: &Changeset, key: &str) -> KeyChange {
        changeset.change_for(key).unwrap_or(KeyChange::Modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn freeze(builder: ChangesetBuilder) -> Changeset {
        builder.freeze(WriteTimestamp::new(1, 1), ConnectionId::new(1))
    }

    #[test]
    fn builder_records_modifications() {
        let mut builder = ChangesetBuilder::new();
        builder.record_modified("k1");
        builder.record_deleted("k2");

        let cs = freeze(builder);
        assert_eq!(cs.change_for("k1"), Some(KeyChange::Modified));
        assert_eq!(cs.change_for("k2"), Some(KeyChange::Deleted));
        assert_eq!(cs.change_for("k3"), None);
        assert_eq!(cs.len(), 2);
    }

    #[test]
    fn later_change_supersedes_earlier() {
        let mut builder = ChangesetBuilder::new();
        builder.record_deleted("k1");
        builder.record_modified("k1");

        let cs = freeze(builder);
        assert_eq!(cs.change_for("k1"), Some(KeyChange::Modified));
        assert_eq!(cs.len(), 1);

        let mut builder = ChangesetBuilder::new();
        builder.record_modified("k1");
        builder.record_deleted("k1");
        assert_eq!(freeze(builder).change_for("k1"), Some(KeyChange::Deleted));
    }

    #[test]
    fn touched_tracks_both_kinds() {
        let mut builder = ChangesetBuilder::new();
        builder.record_modified("k1");
        builder.record_deleted("k2");
        assert!(builder.touched("k1"));
        assert!(builder.touched("k2"));
        assert!(!builder.touched("k3"));
    }

    #[test]
    fn empty_builder() {
        let builder = ChangesetBuilder::new();
        assert!(builder.is_empty());
        assert!(freeze(builder).is_empty());
    }

    #[test]
    fn default_classifier_reads_key_map() {
        let mut builder = ChangesetBuilder::new();
        builder.record_deleted("k1");
        let cs = freeze(builder);

        let classifier = KeyMapClassifier;
        assert_eq!(classifier.classify(&cs, "k1"), KeyChange::Deleted);
    }

    #[test]
    fn default_classifier_evicts_unknown_keys() {
        let cs = freeze(ChangesetBuilder::new());
        let classifier = KeyMapClassifier;
        // Ambiguity resolves to eviction, never to "unchanged".
        assert_eq!(classifier.classify(&cs, "mystery"), KeyChange::Modified);
    }

    #[test]
    fn changeset_carries_origin_and_timestamp() {
        let cs = ChangesetBuilder::new().freeze(WriteTimestamp::new(7, 3), ConnectionId::new(9));
        assert_eq!(cs.timestamp(), WriteTimestamp::new(7, 3));
        assert_eq!(cs.origin(), ConnectionId::new(9));
    }

    #[test]
    fn changesets_share_behind_arc() {
        let mut builder = ChangesetBuilder::new();
        builder.record_modified("k1");
        let cs = Arc::new(freeze(builder));
        let clone = Arc::clone(&cs);
        assert_eq!(clone.change_for("k1"), Some(KeyChange::Modified));
    }
}
