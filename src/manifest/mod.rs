//! Atomic pointer to the live SST set for every table.
//!
//! The directory holds a `CURRENT` file — a single UTF-8 line naming the
//! active `MANIFEST-*` file — and one or more `MANIFEST-*` files, each a
//! complete, self-contained listing of live SST filenames per table in
//! scan order. A checkpoint publishes a new live set by writing a fresh
//! `MANIFEST-*` file and then swapping `CURRENT` to point at it, both via
//! temp-write-then-rename. Readers that opened an older manifest keep
//! observing a consistent, if stale, set — `rename` is atomic on every
//! target platform this crate supports.
//!
//! This replaces the template's WAL-and-snapshot manifest (a log of
//! `ManifestEvent`s replayed at open): WalnutDB's manifest carries no
//! history and needs none, since there is no compaction to record.


use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use thiserror::Error;
use tracing::{debug, trace};

use crate::encoding::{Decode, Encode, EncodingError};

/// Name of the file naming the currently active manifest.
pub const CURRENT_FILE_NAME: &str = "CURRENT";
const MANIFEST_MAGIC: [u8; 4] = *b"WMF1";

/// Errors produced by manifest reads and swaps.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
    #[error("CURRENT file is missing or empty in {0}")]
    MissingCurrent(PathBuf),
    #[error("manifest file {0} named by CURRENT does not exist")]
    DanglingCurrent(PathBuf),
    #[error("corrupt manifest file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("manifest lock poisoned")]
    Poisoned,
}

/// The live SST set for one table, in scan order (oldest first — the order
/// the merge reader must consult them to respect LSM precedence).
pub type LiveSet = BTreeMap<String, Vec<String>>;

/// Tracks the currently installed manifest and hands out atomic swaps to a
/// new live set.
pub struct Manifest {
    dir: PathBuf,
    next_seq: AtomicU64,
    live: RwLock<LiveSet>,
}

impl Manifest {
    /// Opens (or bootstraps, if absent) the manifest in `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let dir = dir.as_ref().to_path_buf();
        let current_path = dir.join(CURRENT_FILE_NAME);

        if !current_path.exists() {
            debug!(dir = %dir.display(), "no manifest found, bootstrapping empty live set");
            let manifest = Manifest { dir: dir.clone(), next_seq: AtomicU64::new(0), live: RwLock::new(LiveSet::new()) };
            manifest.install(LiveSet::new())?;
            return Ok(manifest);
        }

        let name = fs::read_to_string(&current_path)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ManifestError::MissingCurrent(current_path));
        }
        let manifest_path = dir.join(name);
        if !manifest_path.exists() {
            return Err(ManifestError::DanglingCurrent(manifest_path));
        }
        let live = read_manifest_file(&manifest_path)?;
        let seq = parse_seq(name).unwrap_or(0);
        trace!(path = %manifest_path.display(), tables = live.len(), "manifest loaded");

        Ok(Manifest { dir, next_seq: AtomicU64::new(seq + 1), live: RwLock::new(live) })
    }

    /// Returns the live SST filenames for `table`, oldest first.
    pub fn live_ssts(&self, table: &str) -> Result<Vec<String>, ManifestError> {
        let guard = self.live.read().map_err(|_| ManifestError::Poisoned)?;
        Ok(guard.get(table).cloned().unwrap_or_default())
    }

    /// Returns a clone of the full live set, for diagnostics or snapshotting.
    pub fn snapshot(&self) -> Result<LiveSet, ManifestError> {
        Ok(self.live.read().map_err(|_| ManifestError::Poisoned)?.clone())
    }

    /// Publishes `next` as the new live set: writes a fresh `MANIFEST-*`
    /// file, fsyncs it, then atomically repoints `CURRENT` at it. On any
    /// failure the previous manifest remains live, per the
    /// background-checkpoint-failure propagation policy.
    pub fn install(&self, next: LiveSet) -> Result<(), ManifestError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let manifest_name = format!("MANIFEST-{seq:06}");
        let manifest_path = self.dir.join(&manifest_name);

        write_manifest_file(&manifest_path, &next)?;
        atomic_write_current(&self.dir, &manifest_name)?;

        let mut guard = self.live.write().map_err(|_| ManifestError::Poisoned)?;
        *guard = next;
        debug!(manifest = %manifest_name, "manifest installed");
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn parse_seq(manifest_name: &str) -> Option<u64> {
    manifest_name.strip_prefix("MANIFEST-")?.parse().ok()
}

fn read_manifest_file(path: &Path) -> Result<LiveSet, ManifestError> {
    let bytes = fs::read(path)?;
    if bytes.len() < MANIFEST_MAGIC.len() {
        return Err(ManifestError::Corrupt { path: path.to_path_buf(), reason: "file too short".into() });
    }
    if bytes[..MANIFEST_MAGIC.len()] != MANIFEST_MAGIC {
        return Err(ManifestError::Corrupt { path: path.to_path_buf(), reason: "bad magic header".into() });
    }
    let mut offset = MANIFEST_MAGIC.len();
    let (table_count, n) = u32::decode_from(&bytes[offset..]).map_err(|e| corrupt(path, e))?;
    offset += n;

    let mut live = LiveSet::new();
    for _ in 0..table_count {
        let (table_name, n) = String::decode_from(&bytes[offset..]).map_err(|e| corrupt(path, e))?;
        offset += n;
        let (sst_count, n) = u32::decode_from(&bytes[offset..]).map_err(|e| corrupt(path, e))?;
        offset += n;
        let mut filenames = Vec::with_capacity(sst_count as usize);
        for _ in 0..sst_count {
            let (filename, n) = String::decode_from(&bytes[offset..]).map_err(|e| corrupt(path, e))?;
            offset += n;
            filenames.push(filename);
        }
        live.insert(table_name, filenames);
    }
    Ok(live)
}

fn corrupt(path: &Path, e: EncodingError) -> ManifestError {
    ManifestError::Corrupt { path: path.to_path_buf(), reason: e.to_string() }
}

fn write_manifest_file(path: &Path, live: &LiveSet) -> Result<(), ManifestError> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&MANIFEST_MAGIC);
    (live.len() as u32).encode_to(&mut buf)?;
    for (table, filenames) in live {
        table.encode_to(&mut buf)?;
        (filenames.len() as u32).encode_to(&mut buf)?;
        for filename in filenames {
            filename.encode_to(&mut buf)?;
        }
    }

    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp_path)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    fs::rename(&tmp_path, path)?;
    fsync_dir(path.parent().unwrap_or_else(|| Path::new(".")))?;
    Ok(())
}

/// Writes `manifest_name` into `CURRENT` via temp-write + rename, per
/// `spec.md` §6.
fn atomic_write_current(dir: &Path, manifest_name: &str) -> Result<(), ManifestError> {
    let current_path = dir.join(CURRENT_FILE_NAME);
    let tmp_path = dir.join(format!("{CURRENT_FILE_NAME}.tmp"));
    let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp_path)?;
    writeln!(file, "{manifest_name}")?;
    file.sync_all()?;
    fs::rename(&tmp_path, &current_path)?;
    fsync_dir(dir)?;
    Ok(())
}

fn fsync_dir(dir: &Path) -> Result<(), ManifestError> {
    let dir_file = File::open(dir)?;
    dir_file.sync_all()?;
    Ok(())
}
