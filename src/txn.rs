//! Transaction staging buffer and WAL-then-apply commit pipeline.
//!
//! A [`Transaction`] accumulates WAL frames plus in-memory apply/rollback
//! closures, then commits them as one unit: frames are flushed through the
//! WAL's group-commit pipeline first, and only once that succeeds does the
//! apply queue run. No MemTable mutation ever precedes WAL durability —
//! this is the crash-safety invariant `spec.md` §4.8 states explicitly.
//!
//! Grounded in the template's put/delete methods, which already sequence
//! "WAL append, then MemTable mutation"; this module makes that sequencing
//! an explicit, reusable object instead of inlining it per call site.

use thiserror::Error;

use crate::wal::{Durability, WalError, WalFrame, WalWriter};

/// Errors produced while committing a [`Transaction`].
#[derive(Debug, Error)]
pub enum TxnError {
    #[error("wal error: {0}")]
    Wal(#[from] WalError),
}

type Closure = Box<dyn FnOnce() + Send>;

/// A thread-local staging buffer for one logical transaction.
///
/// Frames are staged via `add_put`/`add_delete`/`add_drop_table`; in-memory
/// effects are deferred via `add_apply` (runs only after WAL durability)
/// and `add_rollback` (runs only if the commit fails before that point).
pub struct Transaction {
    tx_id: u64,
    frames: Vec<WalFrame>,
    applies: Vec<Closure>,
    rollbacks: Vec<Closure>,
}

impl Transaction {
    pub fn new(tx_id: u64) -> Self {
        Transaction { tx_id, frames: Vec::new(), applies: Vec::new(), rollbacks: Vec::new() }
    }

    pub fn tx_id(&self) -> u64 {
        self.tx_id
    }

    pub fn add_put(&mut self, table: impl Into<String>, key: Vec<u8>, value: Vec<u8>) {
        self.frames.push(WalFrame::Put { tx_id: self.tx_id, table: table.into(), key, value });
    }

    pub fn add_delete(&mut self, table: impl Into<String>, key: Vec<u8>) {
        self.frames.push(WalFrame::Delete { tx_id: self.tx_id, table: table.into(), key });
    }

    pub fn add_drop_table(&mut self, table: impl Into<String>) {
        self.frames.push(WalFrame::DropTable { tx_id: self.tx_id, table: table.into() });
    }

    /// Queues a MemTable mutation (or other in-memory bookkeeping) to run
    /// once the transaction's frames are durable.
    pub fn add_apply(&mut self, f: impl FnOnce() + Send + 'static) {
        self.applies.push(Box::new(f));
    }

    /// Queues compensation to run, in reverse staging order, if the commit
    /// fails before WAL durability is reached.
    pub fn add_rollback(&mut self, f: impl FnOnce() + Send + 'static) {
        self.rollbacks.push(Box::new(f));
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Flushes staged frames through `wal` at `durability`. On success runs
    /// the apply queue in order and drops the rollback queue. On failure
    /// runs the rollback queue in reverse order and surfaces the error.
    pub fn commit(self, wal: &WalWriter, durability: Durability) -> Result<(), TxnError> {
        let Transaction { tx_id, frames, applies, rollbacks } = self;

        let mut full = Vec::with_capacity(frames.len() + 2);
        full.push(WalFrame::Begin { tx_id });
        full.extend(frames);
        full.push(WalFrame::Commit { tx_id });

        match wal.append_transaction(&full, durability) {
            Ok(()) => {
                for apply in applies {
                    apply();
                }
                Ok(())
            }
            Err(e) => {
                for rollback in rollbacks.into_iter().rev() {
                    rollback();
                }
                Err(TxnError::from(e))
            }
        }
    }
}

#[cfg(test)]
mod tests;
