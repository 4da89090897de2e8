//! # WalnutDB
//!
//! An embeddable, single-process key-value storage engine built on a
//! **Log-Structured Merge Tree (LSM-tree)** architecture, with typed tables,
//! primary keys, and secondary indexes (including unique indexes).
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                           Database                              │
//! │  ┌───────────────┐   ┌───────────────┐   ┌──────────────────┐  │
//! │  │  Table "a"     │   │  Table "b"     │   │  Unique guard    │  │
//! │  │  MemTable      │   │  MemTable      │   │  map             │  │
//! │  │  + SSTables    │   │  + SSTables    │   │                  │  │
//! │  └───────┬────────┘   └───────┬────────┘   └──────────────────┘  │
//! │          │   checkpoint       │   checkpoint                    │
//! │          └────────►  ┌────────┴─────────┐                       │
//! │                      │  shared WAL       │                       │
//! │                      │  (group commit)   │                       │
//! │                      └────────┬──────────┘                       │
//! │                               │                                  │
//! │                      ┌────────┴──────────┐                       │
//! │                      │  Manifest          │                      │
//! │                      │  (CURRENT + files) │                      │
//! │                      └───────────────────┘                       │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`encoding`] | Deterministic binary encoding shared by every on-disk format |
//! | [`codec`] | Order-preserving scalar-to-bytes encoding for index keys |
//! | [`wal`] | Group-committed, CRC-protected write-ahead log |
//! | [`memtable`] | In-memory ordered map with tombstones and range snapshots |
//! | [`sstable`] | Immutable, sorted, on-disk table with a sparse anchor index |
//! | [`manifest`] | Atomic `CURRENT` + `MANIFEST-*` pointer to the live SST set |
//! | [`guard`] | Unique-value reservation registry |
//! | [`merge`] | MemTable + SST merge reader with tombstone masking |
//! | [`txn`] | Transaction staging and WAL-then-apply commit pipeline |
//! | [`table`] | Table CRUD with secondary index maintenance |
//! | [`db`] | Top-level database handle: open, checkpoint, close |
//! | [`diagnostics`] | WAL/SST inspection, independent of any CLI front end |
//!
//! ## Key properties
//!
//! - **Write-ahead logging with group commit** — concurrent transactions are
//!   batched into a single fsync per group, at one of three durability
//!   levels (`None`, `Safe`, `Paranoid`).
//! - **Read-committed visibility** — no multi-version snapshot isolation;
//!   readers see the latest committed state.
//! - **Unique indexes enforced at write time** — a reservation registry
//!   serializes ownership of an index value across concurrent writers, with
//!   no read-side deduplication.
//! - **Crash-safe recovery** — WAL replay reconstructs MemTables from the
//!   last intact committed transaction; a corrupt tail is detected and can
//!   be truncated.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use walnutdb::{Database, WalnutConfig, Scalar, TableSpec, IndexSpec};
//! use std::sync::Arc;
//!
//! let spec = TableSpec::new("users")
//!     .with_index(IndexSpec::new("email").unique());
//!
//! let db = Database::open("/tmp/my_db", WalnutConfig::default(), vec![spec]).unwrap();
//! let users = db.table("users").unwrap();
//!
//! users
//!     .upsert(b"user-1".to_vec(), b"{\"email\":\"a@b.com\"}".to_vec())
//!     .unwrap();
//!
//! let row = users.get(b"user-1").unwrap();
//! assert!(row.is_some());
//!
//! db.checkpoint().unwrap();
//! db.close().unwrap();
//! ```

#![allow(dead_code)]

pub mod codec;
pub mod db;
pub mod diagnostics;
pub mod encoding;
pub mod guard;
pub mod manifest;
pub mod memtable;
pub mod merge;
pub mod sstable;
pub mod table;
pub mod txn;
pub mod wal;

pub use codec::{CodecError, IndexKeyCodec, Scalar};
pub use db::{Database, DbError, WalnutConfig};
pub use table::{IndexExtractor, IndexSpec, PayloadCodec, Table, TableError, TableSpec};
pub use wal::Durability;
