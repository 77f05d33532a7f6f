//! Per-connection row caches and the changeset merge algorithm.
//!
//! Each connection owns two size-bounded caches with least-recently-used
//! eviction: an object cache for row values and a metadata cache. Both live
//! with the connection's cache timestamp under one lock, so merging a
//! changeset and advancing the timestamp is atomic per connection.

use crate::changeset::{Changeset, ChangesetClassifier, KeyChange};
use crate::config::Config;
use crate::types::WriteTimestamp;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Counters describing one cache's effectiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that fell through to the engine.
    pub misses: u64,
    /// Current number of cached entries.
    pub len: usize,
    /// Maximum number of entries.
    pub capacity: usize,
}

/// How much of a connection's caches to drop on a memory flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushLevel {
    /// Trim each cache to half its current size, dropping the
    /// least-recently-used entries first.
    Partial,
    /// Drop every cached entry.
    Full,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    accessed: u64,
}

/// A size-bounded map with least-recently-used eviction.
///
/// Recency is tracked with a monotonically increasing access counter per
/// entry; eviction scans for the minimum. Capacities are small, so the
/// linear scan is fine.
#[derive(Debug)]
pub struct LruCache<V> {
    capacity: usize,
    entries: HashMap<String, Entry<V>>,
    tick: u64,
    hits: u64,
    misses: u64,
}

impl<V> LruCache<V> {
    /// Creates a cache bounded to `capacity` entries. A zero capacity
    /// disables caching entirely.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            tick: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Looks up a key, marking it most-recently-used on a hit.
    pub fn get(&mut self, key: &str) -> Option<&V> {
        self.tick += 1;
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.accessed = self.tick;
                self.hits += 1;
                Some(&entry.value)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Inserts or replaces an entry, evicting the least-recently-used
    /// entry first when at capacity.
    pub fn insert(&mut self, key: &str, value: V) {
        if self.capacity == 0 {
            return;
        }
        self.tick += 1;
        if !self.entries.contains_key(key) && self.entries.len() >= self.capacity {
            self.evict_one();
        }
        self.entries.insert(
            key.to_owned(),
            Entry {
                value,
                accessed: self.tick,
            },
        );
    }

    /// Removes an entry.
    pub fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Evicts least-recently-used entries until at most `target` remain.
    pub fn trim_to(&mut self, target: usize) {
        while self.entries.len() > target {
            self.evict_one();
        }
    }

    /// Returns the number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns hit/miss/occupancy counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            len: self.entries.len(),
            capacity: self.capacity,
        }
    }

    fn evict_one(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.accessed)
            .map(|(key, _)| key.clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
        }
    }
}

/// One connection's cache view: the snapshot timestamp up to which the
/// caches are known consistent, plus the object and metadata caches.
///
/// Shared between the connection's worker (reads, merges before opening an
/// engine snapshot) and the coordinator (commit fan-out); the enclosing
/// mutex is the view's serializing domain. Holders of the view lock must
/// never call into the coordinator or the engine.
#[derive(Debug)]
pub(crate) struct CacheView {
    /// Snapshot up to which these caches are known consistent.
    pub timestamp: WriteTimestamp,
    /// Decoded row values.
    pub objects: LruCache<Arc<Vec<u8>>>,
    /// Row metadata; `Some(None)` caches "row has no metadata".
    pub metadata: LruCache<Option<Arc<Vec<u8>>>>,
}

impl CacheView {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            timestamp: WriteTimestamp::ZERO,
            objects: LruCache::new(config.object_cache_capacity),
            metadata: LruCache::new(config.metadata_cache_capacity),
        }
    }

    /// Merges changesets newer than the view's timestamp, then advances the
    /// timestamp to `up_to`.
    ///
    /// Deleted and modified keys are evicted from both caches; values are
    /// refetched lazily. The merge is idempotent and timestamp-monotonic,
    /// so the same changeset arriving twice (once via a read-path catch-up,
    /// once via commit fan-out) is harmless.
    pub(crate) fn merge(
        &mut self,
        changesets: &[Arc<Changeset>],
        up_to: WriteTimestamp,
        classifier: &dyn ChangesetClassifier,
    ) -> usize {
        let mut applied = 0;
        for changeset in changesets {
            if changeset.timestamp() <= self.timestamp {
                continue;
            }
            for key in changeset.keys() {
                match classifier.classify(changeset, key) {
                    KeyChange::Unchanged => {}
                    KeyChange::Deleted | KeyChange::Modified => {
                        self.objects.remove(key);
                        self.metadata.remove(key);
                    }
                }
            }
            applied += 1;
        }
        if up_to > self.timestamp {
            self.timestamp = up_to;
        }
        if applied > 0 {
            trace!(applied, timestamp = %self.timestamp, "merged changesets into cache view");
        }
        applied
    }

    /// Drops cached rows without touching the timestamp.
    pub(crate) fn flush(&mut self, level: FlushLevel) {
        match level {
            FlushLevel::Partial => {
                self.objects.trim_to(self.objects.len() / 2);
                self.metadata.trim_to(self.metadata.len() / 2);
            }
            FlushLevel::Full => {
                self.objects.clear();
                self.metadata.clear();
            }
        }
    }
}
