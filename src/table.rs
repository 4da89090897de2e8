//! Table CRUD with secondary index maintenance.
//!
//! A [`Table`] owns one primary keyspace plus one keyspace per declared
//! secondary index, each backed by its own [`MemTable`] and SST set (see
//! `spec.md` §3: "a secondary index is a table whose name follows a
//! reserved pattern that identifies its parent table and index name").
//! Index entries are composite `(valuePrefix, pk)` keys with an empty
//! value; the object-to-scalar mapping is supplied by the caller as an
//! [`IndexExtractor`] rather than derived by reflection, since WalnutDB has
//! no schema or serialization format of its own (`spec.md` §2 Non-goals).
//!
//! This generalizes the template's single-keyspace `engine` CRUD surface
//! (`put`/`delete`/`get`/`scan` over one flat map) into one instance per
//! table, with the reservation dance around unique indexes layered on top
//! of the plain WAL-then-apply pipeline `crate::txn` already provides.

#[cfg(test)]
mod tests;

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::codec::{CodecError, IndexKeyCodec, Scalar};
use crate::guard::{GuardError, GuardMap};
use crate::manifest::{Manifest, ManifestError};
use crate::memtable::{MemTable, MemTableError};
use crate::merge::{CancellationToken, MergeError, MergeReader, MergedSstStream};
use crate::sstable::{SstError, SstReader};
use crate::txn::{Transaction, TxnError};
use crate::wal::{Durability, WalWriter};

/// Declares one secondary index: the attribute name the extractor reports
/// it under, and whether values of that attribute must be unique across
/// live rows.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub name: String,
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>) -> Self {
        IndexSpec { name: name.into(), unique: false }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Maps a stored row to the scalar values its secondary indexes are keyed
/// on. Supplied by the caller as part of a table's [`TableSpec`], standing
/// in for the out-of-scope object-to-bytes mapping `spec.md` §2 excludes.
pub type IndexExtractor = Arc<dyn Fn(&[u8]) -> Vec<(String, Scalar)> + Send + Sync>;

fn no_indexed_scalars(_payload: &[u8]) -> Vec<(String, Scalar)> {
    Vec::new()
}

/// Declares one table: its name, its secondary indexes, and the extractor
/// used to compute each index's scalar from a row's payload. A table with
/// no declared indexes defaults to an extractor that reports none.
#[derive(Clone)]
pub struct TableSpec {
    pub name: String,
    pub indexes: Vec<IndexSpec>,
    pub extractor: IndexExtractor,
}

impl std::fmt::Debug for TableSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableSpec").field("name", &self.name).field("indexes", &self.indexes).finish()
    }
}

impl TableSpec {
    pub fn new(name: impl Into<String>) -> Self {
        TableSpec { name: name.into(), indexes: Vec::new(), extractor: Arc::new(no_indexed_scalars) }
    }

    pub fn with_index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn with_extractor(mut self, extractor: IndexExtractor) -> Self {
        self.extractor = extractor;
        self
    }
}

/// Hook for transforming a row's payload bytes before they are written to
/// (or after they are read from) an SST, e.g. for at-rest encryption.
/// `IdentityPayloadCodec` is the default: a byte-for-byte passthrough.
pub trait PayloadCodec: Send + Sync {
    fn encode(&self, key: &[u8], payload: &[u8]) -> Vec<u8>;
    fn decode(&self, key: &[u8], payload: &[u8]) -> Vec<u8>;
}

/// No-op [`PayloadCodec`].
pub struct IdentityPayloadCodec;

impl PayloadCodec for IdentityPayloadCodec {
    fn encode(&self, _key: &[u8], payload: &[u8]) -> Vec<u8> {
        payload.to_vec()
    }

    fn decode(&self, _key: &[u8], payload: &[u8]) -> Vec<u8> {
        payload.to_vec()
    }
}

/// Errors produced by [`Table`] operations.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("unique violation on index {index}")]
    UniqueViolation { index: String },
    #[error("operation cancelled")]
    Cancelled,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("memtable error: {0}")]
    MemTable(#[from] MemTableError),
    #[error("sst error: {0}")]
    Sst(#[from] SstError),
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
    #[error("guard error: {0}")]
    Guard(#[from] GuardError),
    #[error("transaction error: {0}")]
    Txn(#[from] TxnError),
    #[error("internal: {0}")]
    Internal(String),
}

impl From<MergeError> for TableError {
    fn from(e: MergeError) -> Self {
        match e {
            MergeError::Cancelled => TableError::Cancelled,
            MergeError::Sst(e) => TableError::Sst(e),
        }
    }
}

/// Returns the reserved storage name for `index` on `table`, per
/// `spec.md` §3's "name follows a reserved pattern that identifies its
/// parent table and index name".
pub fn index_storage_name(table: &str, index: &str) -> String {
    format!("{table}$${index}")
}

/// Options controlling a range or index scan.
#[derive(Clone, Default)]
pub struct ScanOptions {
    pub skip: usize,
    pub take: usize,
    pub descending: bool,
    pub after_exclusive: Option<Vec<u8>>,
    pub cancel: Option<CancellationToken>,
}

impl ScanOptions {
    pub fn new(take: usize) -> Self {
        ScanOptions { take, ..Default::default() }
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    pub fn after(mut self, cursor: Vec<u8>) -> Self {
        self.after_exclusive = Some(cursor);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// One keyspace — the primary table or one of its secondary indexes —
/// backed by a MemTable and a set of immutable SSTs, oldest first.
pub(crate) struct Storage {
    pub(crate) name: String,
    pub(crate) memtable: Arc<MemTable>,
    pub(crate) ssts: RwLock<Vec<Arc<SstReader>>>,
}

impl Storage {
    fn open(dir: &Path, name: &str, manifest: &Manifest) -> Result<Self, TableError> {
        let filenames = manifest.live_ssts(name)?;
        let mut ssts = Vec::with_capacity(filenames.len());
        for filename in &filenames {
            ssts.push(Arc::new(SstReader::open(dir.join(filename))?));
        }
        Ok(Storage { name: name.to_string(), memtable: Arc::new(MemTable::new()), ssts: RwLock::new(ssts) })
    }

    fn try_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TableError> {
        if let Some(entry) = self.memtable.try_get(key)? {
            return Ok(if entry.tombstone { None } else { entry.value });
        }
        let ssts = self.ssts.read().map_err(|_| TableError::Internal("storage lock poisoned".into()))?;
        for sst in ssts.iter().rev() {
            if let Some(found) = sst.try_get(key)? {
                return Ok(found);
            }
        }
        Ok(None)
    }

    fn merge_reader(
        &self,
        from: &[u8],
        to_exclusive: &[u8],
        after_exclusive: Option<&[u8]>,
        cancel: Option<CancellationToken>,
    ) -> Result<impl Iterator<Item = Result<(Vec<u8>, Vec<u8>), MergeError>>, TableError> {
        let snapshot = self.memtable.snapshot_range(from, to_exclusive, after_exclusive)?;
        let ssts = self.ssts.read().map_err(|_| TableError::Internal("storage lock poisoned".into()))?;
        let iters = ssts.iter().rev().map(|s| s.scan_range(from, to_exclusive)).collect();
        let merged = MergedSstStream::new(iters);
        let mut reader = MergeReader::new(snapshot, merged);
        if let Some(token) = cancel {
            reader = reader.with_cancellation(token);
        }
        let cursor = after_exclusive.map(|c| c.to_vec());
        Ok(reader.filter(move |item| match item {
            Ok((k, _)) => cursor.as_deref().is_none_or(|c| k.as_slice() > c),
            Err(_) => true,
        }))
    }
}

fn find_scalar<'a>(scalars: &'a [(String, Scalar)], name: &str) -> Option<&'a Scalar> {
    scalars.iter().find(|(n, _)| n == name).map(|(_, s)| s)
}

/// One declared table: its primary keyspace, its secondary index
/// keyspaces, and the shared engine-level services (WAL, manifest, unique
/// guard) it commits through.
pub struct Table {
    name: String,
    indexes: Vec<IndexSpec>,
    extractor: IndexExtractor,
    primary: Storage,
    index_storages: HashMap<String, Storage>,
    wal: Arc<WalWriter>,
    guard: Arc<GuardMap>,
    payload_codec: Arc<dyn PayloadCodec>,
    tx_id_counter: Arc<AtomicU64>,
    unique_backoff_budget: Duration,
    page_size: usize,
    default_durability: Durability,
}

impl Table {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn open(
        dir: &Path,
        spec: TableSpec,
        manifest: &Manifest,
        wal: Arc<WalWriter>,
        guard: Arc<GuardMap>,
        payload_codec: Arc<dyn PayloadCodec>,
        tx_id_counter: Arc<AtomicU64>,
        unique_backoff_budget: Duration,
        page_size: usize,
        default_durability: Durability,
    ) -> Result<Self, TableError> {
        let primary = Storage::open(dir, &spec.name, manifest)?;
        let mut index_storages = HashMap::new();
        for index in &spec.indexes {
            let storage_name = index_storage_name(&spec.name, &index.name);
            index_storages.insert(index.name.clone(), Storage::open(dir, &storage_name, manifest)?);
        }
        let extractor = spec.extractor.clone();
        Ok(Table {
            name: spec.name,
            indexes: spec.indexes,
            extractor,
            primary,
            index_storages,
            wal,
            guard,
            payload_codec,
            tx_id_counter,
            unique_backoff_budget,
            page_size,
            default_durability,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn index_storage(&self, index_name: &str) -> Result<&Storage, TableError> {
        self.index_storages
            .get(index_name)
            .ok_or_else(|| TableError::InvalidArgument(format!("table {} has no index {index_name}", self.name)))
    }

    fn next_tx_id(&self) -> u64 {
        self.tx_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Storage names this table occupies: the primary table first, then
    /// each secondary index, in declaration order. Used by checkpoint to
    /// flush every one of a table's keyspaces together.
    pub(crate) fn storages_for_checkpoint(&self) -> Vec<&Storage> {
        let mut out = vec![&self.primary];
        for index in &self.indexes {
            if let Some(storage) = self.index_storages.get(&index.name) {
                out.push(storage);
            }
        }
        out
    }

    /// Reads the current value for `key`, or `None` if absent or deleted.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TableError> {
        let raw = self.primary.try_get(key)?;
        Ok(raw.map(|payload| self.payload_codec.decode(key, &payload)))
    }

    /// Inserts or replaces the row at `key`, maintaining every declared
    /// secondary index. Unique indexes are enforced at write time via a
    /// reservation handshake with the shared [`GuardMap`] (`spec.md` §4.7):
    /// a writer must win `(index, newValuePrefix)` before it may commit,
    /// backs off for up to `unique_backoff_budget`, and gives up with
    /// [`TableError::UniqueViolation`] if the slot never frees up.
    pub fn upsert(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), TableError> {
        let new_scalars = (self.extractor)(&value);
        let old_raw = self.primary.try_get(&key)?;
        let old_scalars = match &old_raw {
            Some(raw) => (self.extractor)(&self.payload_codec.decode(&key, raw)),
            None => Vec::new(),
        };
        let encoded_value = self.payload_codec.encode(&key, &value);

        let mut reserved: Vec<(String, Vec<u8>)> = Vec::new();
        if let Err(e) = self.reserve_unique_slots(&key, &new_scalars, &mut reserved) {
            self.release_all(&reserved, &key);
            return Err(e);
        }
        if let Err(e) = self.validate_unique_slots(&key, &new_scalars) {
            self.release_all(&reserved, &key);
            return Err(e);
        }

        let tx_id = self.next_tx_id();
        let mut txn = Transaction::new(tx_id);

        // A reservation won above must not outlive a commit that never
        // reaches WAL durability (spec.md §4.9 step 3 / §4.8's rollback-queue
        // contract): release it if `txn.commit` fails.
        for (index_name, prefix) in &reserved {
            let guard = Arc::clone(&self.guard);
            let index_name = index_name.clone();
            let prefix = prefix.clone();
            let pk = key.clone();
            txn.add_rollback(move || {
                let _ = guard.release(&index_name, &prefix, &pk);
            });
        }

        for index in &self.indexes {
            let new_scalar = find_scalar(&new_scalars, &index.name);
            let old_scalar = find_scalar(&old_scalars, &index.name);
            let new_prefix = new_scalar.map(IndexKeyCodec::encode).transpose()?;
            let old_prefix = old_scalar.map(IndexKeyCodec::encode).transpose()?;
            if old_prefix == new_prefix {
                continue;
            }
            let storage_name = index_storage_name(&self.name, &index.name);
            let storage = self.index_storage(&index.name)?;

            if let Some(op) = &old_prefix {
                let old_key = IndexKeyCodec::compose_index_entry_key(op, &key)?;
                txn.add_delete(storage_name.clone(), old_key.clone());
                let mt = Arc::clone(&storage.memtable);
                txn.add_apply(move || {
                    let _ = mt.delete(old_key);
                });
            }
            if let Some(np) = &new_prefix {
                let new_key = IndexKeyCodec::compose_index_entry_key(np, &key)?;
                txn.add_put(storage_name.clone(), new_key.clone(), Vec::new());
                let mt = Arc::clone(&storage.memtable);
                let new_key2 = new_key.clone();
                txn.add_apply(move || {
                    let _ = mt.upsert(new_key2, Vec::new());
                });

                if index.unique {
                    self.stage_unique_sweep(&mut txn, &storage_name, storage, np, &key)?;
                }
            }
            if index.unique {
                if let Some(op) = old_prefix {
                    if Some(op.clone()) != new_prefix {
                        let guard = Arc::clone(&self.guard);
                        let idx_name = index.name.clone();
                        let pk = key.clone();
                        txn.add_apply(move || {
                            let _ = guard.release(&idx_name, &op, &pk);
                        });
                    }
                }
            }
        }

        txn.add_put(self.name.clone(), key.clone(), encoded_value.clone());
        let primary_mt = Arc::clone(&self.primary.memtable);
        let key_for_apply = key;
        txn.add_apply(move || {
            let _ = primary_mt.upsert(key_for_apply, encoded_value);
        });

        txn.commit(&self.wal, self.default_durability)?;
        Ok(())
    }

    /// Removes the row at `key` and every secondary index entry pointing
    /// at it. Returns `false` if the key was already absent.
    pub fn delete(&self, key: &[u8]) -> Result<bool, TableError> {
        let old_raw = self.primary.try_get(key)?;
        let Some(old_raw) = old_raw else { return Ok(false) };
        let old_payload = self.payload_codec.decode(key, &old_raw);
        let old_scalars = (self.extractor)(&old_payload);

        let tx_id = self.next_tx_id();
        let mut txn = Transaction::new(tx_id);

        for index in &self.indexes {
            let Some(scalar) = find_scalar(&old_scalars, &index.name) else { continue };
            let prefix = IndexKeyCodec::encode(scalar)?;
            let composite = IndexKeyCodec::compose_index_entry_key(&prefix, key)?;
            let storage_name = index_storage_name(&self.name, &index.name);
            let storage = self.index_storage(&index.name)?;

            txn.add_delete(storage_name, composite.clone());
            let mt = Arc::clone(&storage.memtable);
            txn.add_apply(move || {
                let _ = mt.delete(composite);
            });

            if index.unique {
                let guard = Arc::clone(&self.guard);
                let idx_name = index.name.clone();
                let pk = key.to_vec();
                txn.add_apply(move || {
                    let _ = guard.release(&idx_name, &prefix, &pk);
                });
            }
        }

        txn.add_delete(self.name.clone(), key.to_vec());
        let primary_mt = Arc::clone(&self.primary.memtable);
        let key_for_apply = key.to_vec();
        txn.add_apply(move || {
            let _ = primary_mt.delete(key_for_apply);
        });

        txn.commit(&self.wal, self.default_durability)?;
        Ok(true)
    }

    /// Scans the primary table's keys in `[from, to_exclusive)`.
    pub fn range_scan(
        &self,
        from: &[u8],
        to_exclusive: &[u8],
        opts: ScanOptions,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, TableError> {
        self.scan_storage(&self.primary, from, to_exclusive, opts)
    }

    /// Scans `index_name`'s composite keys in `[from_prefix, to_prefix)`
    /// and resolves each match back to its current primary row, honoring a
    /// MemTable tombstone that may have superseded the index entry
    /// (`spec.md` §4.9: no read-side dedup by value prefix, only pk
    /// resolution).
    pub fn index_scan(
        &self,
        index_name: &str,
        from_prefix: &[u8],
        to_prefix_exclusive: &[u8],
        opts: ScanOptions,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, TableError> {
        let storage = self.index_storage(index_name)?;
        let raw = self.scan_storage(storage, from_prefix, to_prefix_exclusive, opts)?;
        let mut out = Vec::with_capacity(raw.len());
        for (composite_key, _) in raw {
            let Some(pk) = IndexKeyCodec::extract_primary_key(&composite_key) else { continue };
            if let Some(value) = self.get(pk)? {
                out.push((pk.to_vec(), value));
            }
        }
        Ok(out)
    }

    fn scan_storage(
        &self,
        storage: &Storage,
        from: &[u8],
        to_exclusive: &[u8],
        opts: ScanOptions,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, TableError> {
        let mut reader =
            storage.merge_reader(from, to_exclusive, opts.after_exclusive.as_deref(), opts.cancel.clone())?;

        if !opts.descending {
            let mut out = Vec::new();
            let mut skipped = 0usize;
            loop {
                if out.len() >= opts.take {
                    break;
                }
                let page = crate::merge::read_page(&mut reader, self.page_size)?;
                if page.is_empty() {
                    break;
                }
                for item in page {
                    if skipped < opts.skip {
                        skipped += 1;
                        continue;
                    }
                    out.push(item);
                    if out.len() >= opts.take {
                        break;
                    }
                }
            }
            Ok(out)
        } else {
            let capacity = opts.skip + opts.take;
            let mut ring: VecDeque<(Vec<u8>, Vec<u8>)> = VecDeque::with_capacity(capacity.max(1));
            loop {
                let page = crate::merge::read_page(&mut reader, self.page_size)?;
                if page.is_empty() {
                    break;
                }
                for item in page {
                    if capacity == 0 {
                        continue;
                    }
                    if ring.len() == capacity {
                        ring.pop_front();
                    }
                    ring.push_back(item);
                }
            }
            let mut all: Vec<_> = ring.into_iter().collect();
            all.reverse();
            Ok(all.into_iter().skip(opts.skip).take(opts.take).collect())
        }
    }

    fn reserve_unique_slots(
        &self,
        key: &[u8],
        new_scalars: &[(String, Scalar)],
        reserved: &mut Vec<(String, Vec<u8>)>,
    ) -> Result<(), TableError> {
        for index in &self.indexes {
            if !index.unique {
                continue;
            }
            let Some(scalar) = find_scalar(new_scalars, &index.name) else { continue };
            let prefix = IndexKeyCodec::encode(scalar)?;
            let deadline = Instant::now() + self.unique_backoff_budget;
            loop {
                if self.guard.try_reserve(&index.name, &prefix, key)? {
                    reserved.push((index.name.clone(), prefix));
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(TableError::UniqueViolation { index: index.name.clone() });
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        Ok(())
    }

    fn release_all(&self, reserved: &[(String, Vec<u8>)], key: &[u8]) {
        for (index_name, prefix) in reserved.iter().rev() {
            let _ = self.guard.release(index_name, prefix, key);
        }
    }

    /// After winning every reservation, re-checks each unique index's
    /// current live entries for the new value so a writer that reserved an
    /// empty slot but lost a race to a concurrently-committing sweep still
    /// sees the collision before its own commit.
    fn validate_unique_slots(&self, key: &[u8], new_scalars: &[(String, Scalar)]) -> Result<(), TableError> {
        for index in &self.indexes {
            if !index.unique {
                continue;
            }
            let Some(scalar) = find_scalar(new_scalars, &index.name) else { continue };
            let prefix = IndexKeyCodec::encode(scalar)?;
            let storage = self.index_storage(&index.name)?;
            let upper = IndexKeyCodec::prefix_upper_bound(&prefix);
            let mut reader = storage.merge_reader(&prefix, &upper, None, None)?;
            for item in &mut reader {
                let (composite_key, _) = item?;
                if let Some(existing_pk) = IndexKeyCodec::extract_primary_key(&composite_key) {
                    if existing_pk != key {
                        return Err(TableError::UniqueViolation { index: index.name.clone() });
                    }
                }
            }
        }
        Ok(())
    }

    /// Stages deletes for any other live composite entry under `prefix`
    /// that does not belong to `key`, so a unique index never holds two
    /// live entries for the same value once this transaction applies.
    fn stage_unique_sweep(
        &self,
        txn: &mut Transaction,
        storage_name: &str,
        storage: &Storage,
        prefix: &[u8],
        key: &[u8],
    ) -> Result<(), TableError> {
        let upper = IndexKeyCodec::prefix_upper_bound(prefix);
        let mut reader = storage.merge_reader(prefix, &upper, None, None)?;
        for item in &mut reader {
            let (composite_key, _) = item?;
            let Some(existing_pk) = IndexKeyCodec::extract_primary_key(&composite_key) else { continue };
            if existing_pk == key {
                continue;
            }
            txn.add_delete(storage_name.to_string(), composite_key.clone());
            let mt = Arc::clone(&storage.memtable);
            txn.add_apply(move || {
                let _ = mt.delete(composite_key);
            });
        }
        Ok(())
    }
}
