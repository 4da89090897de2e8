//! Unique-value reservation registry.
//!
//! The serialization point that makes unique indexes safe under contention
//! without holding any WAL or MemTable lock: a writer must win a reservation
//! for `(indexName, valuePrefix)` before it is allowed to commit a row that
//! claims that value. Grounded in the `Mutex<HashMap<...>>` pattern the
//! template uses for its manifest bookkeeping, applied here to a much
//! smaller, single-purpose map.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

/// Errors produced by [`GuardMap`] operations.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("unique guard lock poisoned")]
    Poisoned,
}

type GuardKey = (String, Vec<u8>);

/// Registry mapping `(indexName, valuePrefix)` to the primary key currently
/// permitted to hold that value.
#[derive(Default)]
pub struct GuardMap {
    inner: Mutex<HashMap<GuardKey, Vec<u8>>>,
}

impl GuardMap {
    pub fn new() -> Self {
        GuardMap { inner: Mutex::new(HashMap::new()) }
    }

    /// Attempts to claim `(index, prefix)` for `pk`. Returns `true` if the
    /// slot was free or already owned by `pk`; `false` if a different
    /// primary key owns it.
    pub fn try_reserve(&self, index: &str, prefix: &[u8], pk: &[u8]) -> Result<bool, GuardError> {
        let mut guard = self.inner.lock().map_err(|_| GuardError::Poisoned)?;
        let key = (index.to_string(), prefix.to_vec());
        match guard.get(&key) {
            None => {
                guard.insert(key, pk.to_vec());
                Ok(true)
            }
            Some(owner) if owner.as_slice() == pk => Ok(true),
            Some(_) => Ok(false),
        }
    }

    /// Returns whether `pk` currently owns `(index, prefix)`.
    pub fn is_owner(&self, index: &str, prefix: &[u8], pk: &[u8]) -> Result<bool, GuardError> {
        let guard = self.inner.lock().map_err(|_| GuardError::Poisoned)?;
        let key = (index.to_string(), prefix.to_vec());
        Ok(guard.get(&key).is_some_and(|owner| owner.as_slice() == pk))
    }

    /// Releases `(index, prefix)` iff `pk` is the current owner. A release
    /// by a non-owner is a silent no-op.
    pub fn release(&self, index: &str, prefix: &[u8], pk: &[u8]) -> Result<(), GuardError> {
        let mut guard = self.inner.lock().map_err(|_| GuardError::Poisoned)?;
        let key = (index.to_string(), prefix.to_vec());
        if let std::collections::hash_map::Entry::Occupied(entry) = guard.entry(key) {
            if entry.get().as_slice() == pk {
                entry.remove();
            }
        }
        Ok(())
    }
}
