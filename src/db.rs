//! Top-level database handle: open, checkpoint, drop table, close.
//!
//! A [`Database`] owns the services every [`Table`] shares — the single WAL
//! writer, the manifest, the unique-value [`GuardMap`], and a monotonic
//! transaction id counter — and the per-table state built on top of them.
//! On open it replays the WAL against freshly constructed, empty MemTables
//! before handing control to callers, so every table's in-memory state
//! reflects every committed transaction regardless of whether a checkpoint
//! ever ran for it.
//!
//! Generalizes `aeternusdb::engine::Engine`'s `open`/`close` recovery
//! sequence (manifest load, WAL/memtable reconstruction, orphan SST
//! cleanup, max-LSN computation) from one engine-wide memtable to a map of
//! per-table keyspaces sharing one WAL and one manifest.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::CodecError;
use crate::guard::{GuardError, GuardMap};
use crate::manifest::{LiveSet, Manifest, ManifestError};
use crate::memtable::{MemTable, MemTableError};
use crate::sstable::{sparse_index_path, SstError, SstReader, SstWriter, DEFAULT_ANCHOR_STRIDE};
use crate::table::{IdentityPayloadCodec, PayloadCodec, Storage, Table, TableError, TableSpec};
use crate::txn::{Transaction, TxnError};
use crate::wal::{self, Durability, WalError, WalFrame, WalWriter, WalWriterConfig};

/// Configuration for a [`Database`], covering every tunable `spec.md` §6
/// names: the WAL group-commit window, the default durability level, the
/// SST sparse-index anchor stride, the unique-index reservation backoff
/// budget, and the page size used by paginated scans.
#[derive(Debug, Clone)]
pub struct WalnutConfig {
    pub group_window: Duration,
    pub default_durability: Durability,
    pub anchor_stride: usize,
    pub unique_backoff_budget: Duration,
    pub page_size: usize,
}

impl Default for WalnutConfig {
    fn default() -> Self {
        WalnutConfig {
            group_window: Duration::from_millis(5),
            default_durability: Durability::Safe,
            anchor_stride: DEFAULT_ANCHOR_STRIDE,
            unique_backoff_budget: Duration::from_millis(300),
            page_size: 1024,
        }
    }
}

/// Errors produced by [`Database`] operations, aggregating every module's
/// error type the way `aeternusdb::engine::EngineError` aggregates its own.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wal error: {0}")]
    Wal(#[from] WalError),
    #[error("memtable error: {0}")]
    MemTable(#[from] MemTableError),
    #[error("sst error: {0}")]
    Sst(#[from] SstError),
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
    #[error("guard error: {0}")]
    Guard(#[from] GuardError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("transaction error: {0}")]
    Txn(#[from] TxnError),
    #[error("table error: {0}")]
    Table(#[from] TableError),
    #[error("no table named {0}")]
    UnknownTable(String),
    #[error("duplicate table name {0}")]
    DuplicateTable(String),
    #[error("internal: {0}")]
    Internal(String),
}

/// The top-level WalnutDB handle: a fixed set of [`Table`]s sharing one WAL,
/// one manifest, and one unique-index guard.
pub struct Database {
    dir: PathBuf,
    manifest: Manifest,
    wal: Arc<WalWriter>,
    guard: Arc<GuardMap>,
    tables: RwLock<HashMap<String, Arc<Table>>>,
    tx_id_counter: Arc<AtomicU64>,
    config: WalnutConfig,
    sst_seq: AtomicU64,
}

impl Database {
    /// Opens (or creates) a database rooted at `dir` with `specs` declaring
    /// every table it should expose, using the identity payload codec.
    pub fn open(dir: impl AsRef<Path>, config: WalnutConfig, specs: Vec<TableSpec>) -> Result<Self, DbError> {
        Self::open_with_payload_codec(dir, config, specs, Arc::new(IdentityPayloadCodec))
    }

    /// As [`Database::open`], but with a caller-supplied [`PayloadCodec`]
    /// transform applied to every row's payload before it is written to (or
    /// after it is read from) an SST — the pluggable encryption-at-rest seam
    /// `spec.md` §6 describes.
    pub fn open_with_payload_codec(
        dir: impl AsRef<Path>,
        config: WalnutConfig,
        specs: Vec<TableSpec>,
        payload_codec: Arc<dyn PayloadCodec>,
    ) -> Result<Self, DbError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let manifest = Manifest::open(&dir)?;
        let wal_path = dir.join(wal::WAL_FILE_NAME);

        let scan = wal::scan(&wal_path)?;
        if scan.needs_truncation {
            warn!(
                path = %wal_path.display(),
                last_good_offset = scan.last_good_offset,
                "wal has a torn or corrupt tail; truncating before reopening"
            );
            wal::truncate_to(&wal_path, scan.last_good_offset)?;
        }
        if !scan.pending_tx_ids.is_empty() {
            warn!(pending = ?scan.pending_tx_ids, "wal scan found transactions with no matching commit; discarding them");
        }

        let next_tx_id = scan
            .committed_ops
            .iter()
            .map(WalFrame::tx_id)
            .chain(scan.pending_tx_ids.iter().copied())
            .max()
            .map_or(0, |max| max + 1);

        let wal = Arc::new(WalWriter::open(&dir, WalWriterConfig { group_window: config.group_window })?);
        let guard = Arc::new(GuardMap::new());
        let tx_id_counter = Arc::new(AtomicU64::new(next_tx_id));

        let mut tables = HashMap::with_capacity(specs.len());
        for spec in specs {
            let name = spec.name.clone();
            if tables.contains_key(&name) {
                return Err(DbError::DuplicateTable(name));
            }
            let table = Table::open(
                &dir,
                spec,
                &manifest,
                Arc::clone(&wal),
                Arc::clone(&guard),
                Arc::clone(&payload_codec),
                Arc::clone(&tx_id_counter),
                config.unique_backoff_budget,
                config.page_size,
                config.default_durability,
            )?;
            tables.insert(name, Arc::new(table));
        }

        replay_committed_ops(&tables, scan.committed_ops)?;

        let sst_seq = AtomicU64::new(next_sst_seq(&manifest.snapshot()?));

        info!(dir = %dir.display(), tables = tables.len(), "database opened");
        Ok(Database { dir, manifest, wal, guard, tables: RwLock::new(tables), tx_id_counter, config, sst_seq })
    }

    /// Looks up a declared table by name.
    pub fn table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.read().ok()?.get(name).cloned()
    }

    /// Flushes every table's MemTables (primary and every secondary index)
    /// into fresh SSTs, atomically installs the new manifest live set, and
    /// truncates the WAL since its contents are now durable elsewhere.
    ///
    /// Per `spec.md` §7's background-checkpoint-failure policy: if this
    /// returns `Err`, the previous manifest is still the live, consistent
    /// state — a failed checkpoint never leaves the database half-updated.
    pub fn checkpoint(&self) -> Result<(), DbError> {
        let tables = self.tables.read().map_err(|_| DbError::Internal("tables lock poisoned".into()))?;
        let mut live = self.manifest.snapshot()?;
        // Collect, per storage, the flushed snapshot and its new SST reader,
        // but do NOT touch the memtable or the manifest yet: until the
        // manifest swap below succeeds, the previous live set must remain
        // the only visible state (spec.md §7's failed-checkpoint policy).
        let mut pending: Vec<(&Storage, Vec<(Vec<u8>, crate::memtable::Entry)>, Arc<SstReader>)> = Vec::new();

        for table in tables.values() {
            for storage in table.storages_for_checkpoint() {
                if storage.memtable.is_empty()? {
                    continue;
                }
                let flushed: Vec<(Vec<u8>, crate::memtable::Entry)> = storage.memtable.snapshot_all()?.collect();
                if flushed.is_empty() {
                    continue;
                }
                let records = flushed.iter().map(|(k, e)| (k.clone(), e.value.clone()));

                let seq = self.sst_seq.fetch_add(1, Ordering::SeqCst);
                let filename = format!("{seq:08}-{}.sst", sanitize_storage_name(&storage.name));
                let data_path = self.dir.join(&filename);
                let sxi_path = sparse_index_path(&data_path);

                SstWriter::write(&data_path, &sxi_path, records, self.config.anchor_stride)?;
                let reader = Arc::new(SstReader::open(&data_path)?);

                live.entry(storage.name.clone()).or_default().push(filename);
                pending.push((storage, flushed, reader));
            }
        }

        self.manifest.install(live)?;

        // Only after the manifest names the new SSTs as live do we wire
        // their readers into each storage and retire the flushed memtable
        // entries, so a concurrent reader never observes a window where a
        // just-flushed key is in neither the memtable nor the live SST list.
        for (storage, flushed, reader) in pending.iter() {
            let mut ssts = storage.ssts.write().map_err(|_| DbError::Internal("sst list poisoned".into()))?;
            ssts.push(Arc::clone(reader));
            drop(ssts);
            storage.memtable.checkpoint_clear(flushed)?;
        }

        self.wal.reset()?;
        debug!(new_ssts = pending.len(), "checkpoint complete");
        Ok(())
    }

    /// Drops a table: stages a `DropTable` WAL frame, clears its MemTables
    /// (primary and every secondary index) once that frame is durable, and
    /// removes its storages from the manifest's live set. Any SST files
    /// already on disk for the table are left in place — there is no
    /// compactor to safely reclaim them, per `spec.md`'s Non-goal excluding
    /// SST compaction.
    pub fn drop_table(&self, name: &str) -> Result<(), DbError> {
        let table = {
            let tables = self.tables.read().map_err(|_| DbError::Internal("tables lock poisoned".into()))?;
            tables.get(name).cloned().ok_or_else(|| DbError::UnknownTable(name.to_string()))?
        };

        let tx_id = self.tx_id_counter.fetch_add(1, Ordering::SeqCst);
        let mut txn = Transaction::new(tx_id);
        txn.add_drop_table(name.to_string());
        let memtables: Vec<Arc<MemTable>> =
            table.storages_for_checkpoint().into_iter().map(|s| Arc::clone(&s.memtable)).collect();
        for mt in memtables {
            txn.add_apply(move || {
                let _ = mt.clear();
            });
        }
        txn.commit(&self.wal, self.config.default_durability)?;

        let mut live = self.manifest.snapshot()?;
        for storage in table.storages_for_checkpoint() {
            live.remove(&storage.name);
        }
        self.manifest.install(live)?;

        let mut tables = self.tables.write().map_err(|_| DbError::Internal("tables lock poisoned".into()))?;
        tables.remove(name);
        info!(table = name, "table dropped");
        Ok(())
    }

    /// Closes the database. Consuming `self` drops every table's WAL
    /// handle, the database's own, the manifest, and the guard map, in
    /// order — once the last [`Arc<WalWriter>`] drops, its group-commit
    /// consumer thread is joined, mirroring `aeternusdb::engine::Engine`'s
    /// `close`.
    pub fn close(self) -> Result<(), DbError> {
        info!(dir = %self.dir.display(), "closing database");
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn replay_committed_ops(
    tables: &HashMap<String, Arc<Table>>,
    ops: Vec<WalFrame>,
) -> Result<(), DbError> {
    let mut memtables: HashMap<String, Arc<MemTable>> = HashMap::new();
    for table in tables.values() {
        for storage in table.storages_for_checkpoint() {
            memtables.insert(storage.name.clone(), Arc::clone(&storage.memtable));
        }
    }

    let mut replayed = 0u64;
    for op in ops {
        match op {
            WalFrame::Put { table, key, value, .. } => {
                match memtables.get(&table) {
                    Some(mt) => {
                        mt.upsert(key, value)?;
                        replayed += 1;
                    }
                    None => warn!(table, "wal replay: put for unknown storage; skipping"),
                }
            }
            WalFrame::Delete { table, key, .. } => match memtables.get(&table) {
                Some(mt) => {
                    mt.delete(key)?;
                    replayed += 1;
                }
                None => warn!(table, "wal replay: delete for unknown storage; skipping"),
            },
            WalFrame::DropTable { table, .. } => match tables.get(&table) {
                Some(t) => {
                    for storage in t.storages_for_checkpoint() {
                        storage.memtable.clear()?;
                    }
                    replayed += 1;
                }
                None => warn!(table, "wal replay: drop for unknown table; skipping"),
            },
            WalFrame::Begin { .. } | WalFrame::Commit { .. } => {
                debug_assert!(false, "wal scan must not surface begin/commit bookkeeping frames as committed ops");
            }
        }
    }
    if replayed > 0 {
        info!(replayed, "wal replay complete");
    }
    Ok(())
}

fn next_sst_seq(live: &LiveSet) -> u64 {
    live.values()
        .flatten()
        .filter_map(|name| name.split('-').next())
        .filter_map(|prefix| prefix.parse::<u64>().ok())
        .max()
        .map_or(0, |max| max + 1)
}

fn sanitize_storage_name(name: &str) -> String {
    name.chars().map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' }).collect()
}
