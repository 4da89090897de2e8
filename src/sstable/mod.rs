//! Immutable, sorted, on-disk table with a sparse anchor companion index.
//!
//! An SST is produced once by a checkpoint flush and never mutated again
//! (the finality invariant in `spec.md` §3). This module keeps the
//! template's zero-copy `memmap2`-based read strategy but drops its block
//! framing, bloom filter, and per-record LSN/timestamp versioning — none of
//! those are in scope here: WalnutDB SSTs hold exactly one version per key,
//! in flat `kLen/vLen/key/value` records.
//!
//! # On-disk layout
//!
//! ```text
//! [magic: 8 bytes "SSTv1\0\0\0"]
//! [kLen:u32-LE][vLen:u32-LE][key][value]   <- one per record, ascending key
//! ...
//! [count:u32-LE][crc32:u32-LE]             <- trailer
//! ```
//!
//! The trailer CRC covers the header, every record, and the count field —
//! an addition over the bare record count `spec.md` §3 specifies, adopted
//! per `spec.md` §9's invitation to add one.
//!
//! A companion `*.sst.sxi` file holds a sparse index of `(key, offset)`
//! anchors, one every `anchor_stride` records, so point lookups and range
//! scans can seek close to their target instead of scanning from the start.
//! Losing or corrupting the companion is non-fatal — [`SstReader::open`]
//! logs a warning and falls back to a full scan from the header.


use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crc32fast::Hasher;
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::encoding::{Decode, Encode, EncodingError};

/// 8-byte magic written at the start of every SST data file.
pub const SST_MAGIC: [u8; 8] = *b"SSTv1\0\0\0";
const TRAILER_LEN: usize = 4 + 4; // count:u32-LE, crc32:u32-LE
const RECORD_PREFIX_LEN: usize = 4 + 4; // kLen:u32-LE, vLen:u32-LE

/// Default number of records between sparse-index anchors.
pub const DEFAULT_ANCHOR_STRIDE: usize = 1024;

/// Sentinel `vLen` marking a record as a tombstone rather than a live value.
/// A checkpoint flush writes a table's MemTable tombstones into the new SST
/// using this marker so they keep masking identically-keyed entries in
/// older SSTs of the same table, the same way a MemTable tombstone masks an
/// SST entry (`spec.md` §3's LSM precedence invariant, extended across SST
/// generations since `spec.md` has no compaction to reconcile them).
pub const TOMBSTONE_VLEN: u32 = u32::MAX;

/// Conventional extension for the companion sparse-index file.
pub const SPARSE_INDEX_EXTENSION: &str = "sxi";

/// Errors produced by the SST writer and reader.
#[derive(Debug, Error)]
pub enum SstError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
    /// Header, trailer, ordering, or length mismatch — the file should be
    /// quarantined by the caller and surfaced through diagnostics.
    #[error("corrupt sst at {path}: {reason}")]
    CorruptSst { path: PathBuf, reason: String },
}

/// Summary returned by [`SstWriter::write`], useful for manifest bookkeeping
/// and diagnostics without re-opening the file.
#[derive(Debug, Clone, Default)]
pub struct SstSummary {
    pub record_count: u64,
    pub min_key: Option<Vec<u8>>,
    pub max_key: Option<Vec<u8>>,
}

/// Builds an SST data file and its companion sparse index from a sorted,
/// non-duplicate `(key, value)` stream.
pub struct SstWriter;

impl SstWriter {
    /// Writes `data_path` and, best-effort, `sxi_path` from `records`.
    ///
    /// `records` must yield strictly ascending keys; this is a precondition
    /// enforced by the caller (the checkpoint path flushes an already-sorted
    /// [`crate::memtable::MemTableSnapshot`]) and only checked via debug
    /// assertion here. A `None` value writes a tombstone record
    /// ([`TOMBSTONE_VLEN`]) instead of a live one.
    pub fn write<I>(
        data_path: impl AsRef<Path>,
        sxi_path: impl AsRef<Path>,
        records: I,
        anchor_stride: usize,
    ) -> Result<SstSummary, SstError>
    where
        I: IntoIterator<Item = (Vec<u8>, Option<Vec<u8>>)>,
    {
        let data_path = data_path.as_ref();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(data_path)?;

        let mut hasher = Hasher::new();
        hasher.update(&SST_MAGIC);
        file.write_all(&SST_MAGIC)?;

        let mut offset: u64 = SST_MAGIC.len() as u64;
        let mut count: u64 = 0;
        let mut anchors: Vec<(Vec<u8>, i64)> = Vec::new();
        let mut summary = SstSummary::default();
        let mut prev_key: Option<Vec<u8>> = None;

        for (key, value) in records {
            if let Some(prev) = &prev_key {
                debug_assert!(prev.as_slice() < key.as_slice(), "sst records must be strictly ascending");
            }
            if count as usize % anchor_stride.max(1) == 0 {
                anchors.push((key.clone(), offset as i64));
            }
            let vlen = value.as_ref().map_or(TOMBSTONE_VLEN, |v| v.len() as u32);
            let mut record = Vec::with_capacity(RECORD_PREFIX_LEN + key.len() + value.as_ref().map_or(0, Vec::len));
            (key.len() as u32).encode_to(&mut record)?;
            vlen.encode_to(&mut record)?;
            record.extend_from_slice(&key);
            if let Some(v) = &value {
                record.extend_from_slice(v);
            }

            hasher.update(&record);
            file.write_all(&record)?;
            offset += record.len() as u64;

            if summary.min_key.is_none() {
                summary.min_key = Some(key.clone());
            }
            summary.max_key = Some(key.clone());
            prev_key = Some(key);
            count += 1;
        }

        let count_bytes = (count as u32).to_le_bytes();
        hasher.update(&count_bytes);
        let crc = hasher.finalize();
        file.write_all(&count_bytes)?;
        file.write_all(&crc.to_le_bytes())?;
        file.sync_all()?;

        summary.record_count = count;
        debug!(path = %data_path.display(), count, "sst written");

        if let Err(e) = Self::write_sparse_index(sxi_path.as_ref(), &anchors) {
            warn!(path = %sxi_path.as_ref().display(), error = %e, "failed to write sst sparse index; falling back to full scans for this sst");
        }

        Ok(summary)
    }

    fn write_sparse_index(path: &Path, anchors: &[(Vec<u8>, i64)]) -> Result<(), SstError> {
        let mut buf = Vec::new();
        (anchors.len() as u32).encode_to(&mut buf)?;
        for (key, offset) in anchors {
            (key.len() as u32).encode_to(&mut buf)?;
            buf.extend_from_slice(key);
            offset.encode_to(&mut buf)?;
        }
        let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }
}

struct SparseAnchor {
    key: Vec<u8>,
    offset: i64,
}

/// An immutable, memory-mapped reader over one SST data file, with optional
/// sparse-index acceleration.
pub struct SstReader {
    path: PathBuf,
    mmap: Arc<Mmap>,
    data_start: usize,
    data_end: usize,
    record_count: u64,
    anchors: Vec<SparseAnchor>,
}

impl SstReader {
    /// Opens `path` for reading, verifying the header magic and trailer
    /// CRC. If a sibling `.sxi` file exists but fails to parse, this logs a
    /// warning and proceeds without it rather than failing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SstError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let len = mmap.len();

        if len < SST_MAGIC.len() + TRAILER_LEN {
            return Err(SstError::CorruptSst { path, reason: "file shorter than header+trailer".into() });
        }
        if mmap[..SST_MAGIC.len()] != SST_MAGIC {
            return Err(SstError::CorruptSst { path, reason: "bad magic header".into() });
        }

        let trailer_start = len - TRAILER_LEN;
        let count = u32::from_le_bytes(mmap[trailer_start..trailer_start + 4].try_into().unwrap()) as u64;
        let stored_crc = u32::from_le_bytes(mmap[trailer_start + 4..trailer_start + 8].try_into().unwrap());

        let mut hasher = Hasher::new();
        hasher.update(&mmap[..trailer_start + 4]);
        if hasher.finalize() != stored_crc {
            return Err(SstError::CorruptSst { path, reason: "trailer crc mismatch".into() });
        }

        let sxi_path = sparse_index_path(&path);
        let anchors = match Self::read_sparse_index(&sxi_path) {
            Ok(a) => a,
            Err(e) => {
                warn!(path = %sxi_path.display(), error = %e, "sst sparse index missing or corrupt; falling back to full scan");
                Vec::new()
            }
        };

        trace!(path = %path.display(), count, anchors = anchors.len(), "sst opened");
        Ok(SstReader {
            path,
            mmap: Arc::new(mmap),
            data_start: SST_MAGIC.len(),
            data_end: trailer_start,
            record_count: count,
            anchors,
        })
    }

    fn read_sparse_index(path: &Path) -> Result<Vec<SparseAnchor>, SstError> {
        let bytes = fs::read(path)?;
        let (count, mut offset) = u32::decode_from(&bytes)?;
        let mut anchors = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (klen, n) = u32::decode_from(&bytes[offset..])?;
            offset += n;
            let klen = klen as usize;
            if offset + klen > bytes.len() {
                return Err(SstError::CorruptSst { path: path.to_path_buf(), reason: "truncated sparse index key".into() });
            }
            let key = bytes[offset..offset + klen].to_vec();
            offset += klen;
            let (anchor_offset, n) = i64::decode_from(&bytes[offset..])?;
            offset += n;
            anchors.push(SparseAnchor { key, offset: anchor_offset });
        }
        Ok(anchors)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Finds the start-of-scan byte offset: the greatest anchor whose key is
    /// `<= key`, or the start of the data region if there are no anchors or
    /// none qualify.
    fn seek_start(&self, key: &[u8]) -> usize {
        if self.anchors.is_empty() {
            return self.data_start;
        }
        match self.anchors.binary_search_by(|a| a.key.as_slice().cmp(key)) {
            Ok(i) => self.anchors[i].offset as usize,
            Err(0) => self.data_start,
            Err(i) => self.anchors[i - 1].offset as usize,
        }
    }

    fn read_record_at(&self, offset: usize) -> Result<(Vec<u8>, Option<Vec<u8>>, usize), SstError> {
        let buf = &self.mmap[offset..self.data_end];
        if buf.len() < RECORD_PREFIX_LEN {
            return Err(SstError::CorruptSst { path: self.path.clone(), reason: "truncated record header".into() });
        }
        let (klen, mut cursor) = u32::decode_from(buf).map_err(|e| SstError::CorruptSst {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        let (vlen, n) = u32::decode_from(&buf[cursor..]).map_err(|e| SstError::CorruptSst {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        cursor += n;
        let klen = klen as usize;
        let tombstone = vlen == TOMBSTONE_VLEN;
        let vlen = if tombstone { 0 } else { vlen as usize };
        if cursor + klen + vlen > buf.len() {
            return Err(SstError::CorruptSst { path: self.path.clone(), reason: "record length exceeds file bounds".into() });
        }
        let key = buf[cursor..cursor + klen].to_vec();
        let value = if tombstone { None } else { Some(buf[cursor + klen..cursor + klen + vlen].to_vec()) };
        let next = offset + RECORD_PREFIX_LEN + klen + vlen;
        Ok((key, value, next))
    }

    /// Point lookup. Stops scanning as soon as a key greater than the
    /// target is seen, per `spec.md` §4.4. Returns `Some(None)` if the key's
    /// newest record in this SST is a tombstone, so the caller can stop
    /// consulting older SSTs without treating the key as absent.
    pub fn try_get(&self, key: &[u8]) -> Result<Option<Option<Vec<u8>>>, SstError> {
        let mut offset = self.seek_start(key);
        while offset < self.data_end {
            let (rec_key, value, next) = self.read_record_at(offset)?;
            match rec_key.as_slice().cmp(key) {
                std::cmp::Ordering::Equal => return Ok(Some(value)),
                std::cmp::Ordering::Greater => return Ok(None),
                std::cmp::Ordering::Less => offset = next,
            }
        }
        Ok(None)
    }

    /// Range scan over `[from_inclusive, to_exclusive)`. An empty
    /// `to_exclusive` means unbounded above.
    pub fn scan_range(&self, from_inclusive: &[u8], to_exclusive: &[u8]) -> SstRangeIter {
        let start = self.seek_start(from_inclusive);
        SstRangeIter {
            mmap: Arc::clone(&self.mmap),
            path: self.path.clone(),
            offset: start,
            data_end: self.data_end,
            from_inclusive: from_inclusive.to_vec(),
            to_exclusive: to_exclusive.to_vec(),
            done: false,
        }
    }
}

pub(crate) fn sparse_index_path(data_path: &Path) -> PathBuf {
    let mut os = data_path.as_os_str().to_owned();
    os.push(".");
    os.push(SPARSE_INDEX_EXTENSION);
    PathBuf::from(os)
}

/// Streaming iterator over a key range of one [`SstReader`].
pub struct SstRangeIter {
    mmap: Arc<Mmap>,
    path: PathBuf,
    offset: usize,
    data_end: usize,
    from_inclusive: Vec<u8>,
    to_exclusive: Vec<u8>,
    done: bool,
}

impl Iterator for SstRangeIter {
    /// `None` in the value position is a tombstone record, carried through
    /// so [`crate::merge::MergedSstStream`] can let it mask the same key in
    /// an older SST of the same table.
    type Item = Result<(Vec<u8>, Option<Vec<u8>>), SstError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.offset >= self.data_end {
                return None;
            }
            let buf = &self.mmap[self.offset..self.data_end];
            if buf.len() < RECORD_PREFIX_LEN {
                self.done = true;
                return Some(Err(SstError::CorruptSst { path: self.path.clone(), reason: "truncated record header".into() }));
            }
            let (klen, mut cursor) = match u32::decode_from(buf) {
                Ok(v) => v,
                Err(e) => {
                    self.done = true;
                    return Some(Err(SstError::CorruptSst { path: self.path.clone(), reason: e.to_string() }));
                }
            };
            let (vlen, n) = match u32::decode_from(&buf[cursor..]) {
                Ok(v) => v,
                Err(e) => {
                    self.done = true;
                    return Some(Err(SstError::CorruptSst { path: self.path.clone(), reason: e.to_string() }));
                }
            };
            cursor += n;
            let klen = klen as usize;
            let tombstone = vlen == TOMBSTONE_VLEN;
            let vlen = if tombstone { 0 } else { vlen as usize };
            if cursor + klen + vlen > buf.len() {
                self.done = true;
                return Some(Err(SstError::CorruptSst { path: self.path.clone(), reason: "record length exceeds file bounds".into() }));
            }
            let key = &buf[cursor..cursor + klen];
            let next_offset = self.offset + RECORD_PREFIX_LEN + klen + vlen;

            if !self.to_exclusive.is_empty() && key >= self.to_exclusive.as_slice() {
                self.done = true;
                return None;
            }
            if key < self.from_inclusive.as_slice() {
                self.offset = next_offset;
                continue;
            }
            let key = key.to_vec();
            let value = if tombstone { None } else { Some(buf[cursor + klen..cursor + klen + vlen].to_vec()) };
            self.offset = next_offset;
            return Some(Ok((key, value)));
        }
    }
}
