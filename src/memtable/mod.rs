//! In-memory ordered map absorbing writes until the next checkpoint.
//!
//! A [`MemTable`] holds exactly one entry per key — either a value or a
//! tombstone — and is always strictly newer than any SST belonging to the
//! same table (see the LSM precedence invariant in `spec.md` §3). Unlike
//! the template this module is adapted from, there is no per-key version
//! history and no range-tombstone list: WalnutDB has no multi-version reads
//! and no range-delete operation in scope.
//!
//! Range iteration returns a *snapshot*: a consistent view over `[from,
//! to_exclusive)` that remains valid while concurrent writers keep mutating
//! the live table. This implementation takes the simplest of the options
//! the spec allows ("a persistent ordered map, a copy-on-iterate snapshot,
//! or a skiplist with per-node hazard protection") — a copy-on-iterate clone
//! of the live `BTreeMap`, which is O(n) but correct and adequate at
//! embedded scale.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::sync::RwLock;

use thiserror::Error;
use tracing::trace;

/// Errors produced by [`MemTable`] operations.
#[derive(Debug, Error)]
pub enum MemTableError {
    /// The internal lock was poisoned by a panicking writer.
    #[error("memtable lock poisoned")]
    Poisoned,
    /// A range bound was malformed, e.g. `from > to_exclusive`.
    #[error("invalid range: {0}")]
    InvalidArgument(String),
}

/// A single memtable slot: either a live value or a tombstone.
///
/// A tombstone masks any identically-keyed entry in an older SST of the
/// same table (the LSM precedence invariant).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub tombstone: bool,
    pub value: Option<Vec<u8>>,
}

impl Entry {
    fn live(value: Vec<u8>) -> Self {
        Entry { tombstone: false, value: Some(value) }
    }

    fn deleted() -> Self {
        Entry { tombstone: true, value: None }
    }
}

/// The mutable, in-memory write buffer for one table.
///
/// Concurrent readers and writers are both supported: writers take the
/// write half of the lock only for the duration of a single insert;
/// `snapshot_range` clones the current map before releasing the lock so
/// the returned iterator observes a fixed point in time.
#[derive(Default)]
pub struct MemTable {
    map: RwLock<BTreeMap<Vec<u8>, Entry>>,
}

impl MemTable {
    pub fn new() -> Self {
        MemTable { map: RwLock::new(BTreeMap::new()) }
    }

    /// Set or replace the entry for `key`, clearing any tombstone.
    pub fn upsert(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), MemTableError> {
        let mut guard = self.map.write().map_err(|_| MemTableError::Poisoned)?;
        trace!(key_len = key.len(), value_len = value.len(), "memtable upsert");
        guard.insert(key, Entry::live(value));
        Ok(())
    }

    /// Store a tombstone for `key`, masking any older SST entry.
    pub fn delete(&self, key: Vec<u8>) -> Result<(), MemTableError> {
        let mut guard = self.map.write().map_err(|_| MemTableError::Poisoned)?;
        trace!(key_len = key.len(), "memtable delete");
        guard.insert(key, Entry::deleted());
        Ok(())
    }

    /// Returns the current entry for `key`, including tombstones, or
    /// `None` if the memtable has never seen this key.
    pub fn try_get(&self, key: &[u8]) -> Result<Option<Entry>, MemTableError> {
        let guard = self.map.read().map_err(|_| MemTableError::Poisoned)?;
        Ok(guard.get(key).cloned())
    }

    /// Returns `true` iff `key` is present and tombstoned.
    pub fn has_tombstone_exact(&self, key: &[u8]) -> Result<bool, MemTableError> {
        Ok(self.try_get(key)?.is_some_and(|e| e.tombstone))
    }

    /// Returns a consistent snapshot of entries in `[from, to_exclusive)`.
    ///
    /// An empty `from` means unbounded below; an empty `to_exclusive` means
    /// unbounded above. If `after_exclusive` is given, the snapshot starts
    /// strictly after that key (used for exclusive-cursor pagination).
    pub fn snapshot_range(
        &self,
        from: &[u8],
        to_exclusive: &[u8],
        after_exclusive: Option<&[u8]>,
    ) -> Result<MemTableSnapshot, MemTableError> {
        let guard = self.map.read().map_err(|_| MemTableError::Poisoned)?;
        let lower = match after_exclusive {
            Some(cursor) if cursor > from => cursor.to_vec(),
            _ => from.to_vec(),
        };
        if !to_exclusive.is_empty() && lower.as_slice() > to_exclusive {
            return Err(MemTableError::InvalidArgument(format!(
                "range start {lower:?} is greater than range end {to_exclusive:?}"
            )));
        }
        let entries: Vec<(Vec<u8>, Entry)> = if to_exclusive.is_empty() {
            guard.range(lower.clone()..).map(|(k, v)| (k.clone(), v.clone())).collect()
        } else {
            guard
                .range(lower.clone()..to_exclusive.to_vec())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        let entries = if let Some(cursor) = after_exclusive {
            entries.into_iter().filter(|(k, _)| k.as_slice() > cursor).collect()
        } else {
            entries
        };
        Ok(MemTableSnapshot { entries, pos: 0 })
    }

    /// Returns `true` if the memtable currently holds no entries at all
    /// (used by checkpoint to skip writing an empty SST).
    pub fn is_empty(&self) -> Result<bool, MemTableError> {
        Ok(self.map.read().map_err(|_| MemTableError::Poisoned)?.is_empty())
    }

    /// Returns a full snapshot ordered by key, for flushing to an SST.
    pub fn snapshot_all(&self) -> Result<MemTableSnapshot, MemTableError> {
        self.snapshot_range(&[], &[], None)
    }

    /// Drops every entry, live or tombstoned. Used when a table is dropped
    /// and when replaying a `DropTable` WAL frame on recovery.
    pub fn clear(&self) -> Result<(), MemTableError> {
        let mut guard = self.map.write().map_err(|_| MemTableError::Poisoned)?;
        guard.clear();
        Ok(())
    }

    /// Removes every entry in `flushed` that is still unchanged, i.e. the
    /// live map still holds exactly the value or tombstone that was
    /// snapshotted. A key mutated again after the snapshot was taken lands
    /// in the next generation and is left in place. Called by checkpoint
    /// once `flushed`'s contents are durable in a new SST.
    pub fn checkpoint_clear(&self, flushed: &[(Vec<u8>, Entry)]) -> Result<(), MemTableError> {
        let mut guard = self.map.write().map_err(|_| MemTableError::Poisoned)?;
        for (key, entry) in flushed {
            if guard.get(key) == Some(entry) {
                guard.remove(key);
            }
        }
        Ok(())
    }
}

/// A stable, point-in-time view over a range of memtable entries.
pub struct MemTableSnapshot {
    entries: Vec<(Vec<u8>, Entry)>,
    pos: usize,
}

impl Iterator for MemTableSnapshot {
    type Item = (Vec<u8>, Entry);

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.entries.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }
}

impl MemTableSnapshot {
    pub fn peek(&self) -> Option<&(Vec<u8>, Entry)> {
        self.entries.get(self.pos)
    }

    pub fn len(&self) -> usize {
        self.entries.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.entries.len()
    }
}
