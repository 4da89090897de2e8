//! Integration tests for the public `Database`/`Table` API.
//!
//! These exercise the full stack (WAL → MemTable → SST → manifest) through
//! `walnutdb::{Database, WalnutConfig, TableSpec, IndexSpec}` only, mirroring
//! the concrete end-to-end scenarios the engine is expected to satisfy:
//! basic upsert/get, checkpoint persistence across reopen, unique-index
//! collision, unique-index stress under concurrency, WAL tail truncation on
//! recovery, and ascending/descending pagination.

use rand::Rng;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;
use walnutdb::table::ScanOptions;
use walnutdb::{Database, IndexSpec, Scalar, TableError, TableSpec, WalnutConfig};

fn open(dir: &std::path::Path, specs: Vec<TableSpec>) -> Database {
    Database::open(dir, WalnutConfig::default(), specs).expect("open")
}

/// # Scenario
/// A freshly opened table accepts an upsert and immediately returns it.
#[test]
fn basic_upsert_and_get() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path(), vec![TableSpec::new("widgets")]);
    let widgets = db.table("widgets").unwrap();

    assert_eq!(widgets.get(b"w1").unwrap(), None);
    widgets.upsert(b"w1".to_vec(), b"{\"color\":\"red\"}".to_vec()).unwrap();
    assert_eq!(widgets.get(b"w1").unwrap(), Some(b"{\"color\":\"red\"}".to_vec()));
}

/// # Scenario
/// Data written before a checkpoint is still readable after the database is
/// closed and reopened, with the WAL truncated to empty in between.
#[test]
fn checkpoint_then_reopen_preserves_data() {
    let dir = TempDir::new().unwrap();
    {
        let db = open(dir.path(), vec![TableSpec::new("widgets")]);
        let widgets = db.table("widgets").unwrap();
        for i in 0..20u32 {
            widgets.upsert(i.to_be_bytes().to_vec(), format!("v{i}").into_bytes()).unwrap();
        }
        db.checkpoint().unwrap();
        db.close().unwrap();
    }

    let db = open(dir.path(), vec![TableSpec::new("widgets")]);
    let widgets = db.table("widgets").unwrap();
    for i in 0..20u32 {
        assert_eq!(widgets.get(&i.to_be_bytes()).unwrap(), Some(format!("v{i}").into_bytes()));
    }
}

fn email_from(payload: &[u8]) -> Vec<(String, Scalar)> {
    let text = std::str::from_utf8(payload).unwrap();
    vec![("email".to_string(), Scalar::Str(text.to_string()))]
}

/// # Scenario
/// Two different primary keys racing to claim the same unique-index value:
/// exactly one wins, the other observes `TableError::UniqueViolation`.
#[test]
fn unique_index_collision_is_rejected() {
    let dir = TempDir::new().unwrap();
    let spec = TableSpec::new("accounts")
        .with_index(IndexSpec::new("email").unique())
        .with_extractor(Arc::new(email_from));
    let db = open(dir.path(), vec![spec]);
    let accounts = db.table("accounts").unwrap();

    accounts.upsert(b"a1".to_vec(), b"dup@example.com".to_vec()).unwrap();
    let err = accounts.upsert(b"a2".to_vec(), b"dup@example.com".to_vec()).unwrap_err();
    assert!(matches!(err, TableError::UniqueViolation { index } if index == "email"));
}

/// # Scenario
/// Many threads hammer the same small pool of unique-index values
/// concurrently. Exactly one primary key should ever hold each value at a
/// time, and no two live rows should ever share a value.
#[test]
fn unique_index_stress_never_double_assigns_a_value() {
    let dir = TempDir::new().unwrap();
    let spec = TableSpec::new("accounts")
        .with_index(IndexSpec::new("email").unique())
        .with_extractor(Arc::new(email_from));
    let db = Arc::new(open(dir.path(), vec![spec]));

    let values = ["a@x.com", "b@x.com", "c@x.com"];
    let mut handles = Vec::new();
    for t in 0..8 {
        let db = Arc::clone(&db);
        handles.push(thread::spawn(move || {
            let accounts = db.table("accounts").unwrap();
            let mut rng = rand::rng();
            for i in 0..50 {
                let pk = format!("t{t}-k{i}").into_bytes();
                let value = values[rng.random_range(0..values.len())];
                let _ = accounts.upsert(pk, value.as_bytes().to_vec());
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let accounts = db.table("accounts").unwrap();
    for value in values {
        let prefix = walnutdb::IndexKeyCodec::encode(&Scalar::Str(value.to_string())).unwrap();
        let upper = walnutdb::IndexKeyCodec::prefix_upper_bound(&prefix);
        let owners = accounts.index_scan("email", &prefix, &upper, ScanOptions::new(100)).unwrap();
        assert!(owners.len() <= 1, "value {value} has {} live owners, expected at most 1", owners.len());
    }
}

/// # Scenario
/// A WAL file with a torn/corrupt tail (bytes appended after the last
/// intact committed transaction, e.g. from a crash mid-write) is truncated
/// on open, and every transaction before the tear is still recovered.
#[test]
fn wal_tail_truncation_recovers_committed_prefix() {
    let dir = TempDir::new().unwrap();
    {
        let db = open(dir.path(), vec![TableSpec::new("widgets")]);
        let widgets = db.table("widgets").unwrap();
        widgets.upsert(b"w1".to_vec(), b"v1".to_vec()).unwrap();
        widgets.upsert(b"w2".to_vec(), b"v2".to_vec()).unwrap();
        db.close().unwrap();
    }

    let wal_path = dir.path().join("wal.log");
    let mut bytes = std::fs::read(&wal_path).unwrap();
    bytes.extend_from_slice(&[0xAB; 24]);
    std::fs::write(&wal_path, &bytes).unwrap();

    let db = open(dir.path(), vec![TableSpec::new("widgets")]);
    let widgets = db.table("widgets").unwrap();
    assert_eq!(widgets.get(b"w1").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(widgets.get(b"w2").unwrap(), Some(b"v2".to_vec()));
}

/// # Scenario
/// Paginated ascending and descending range scans over the same keyspace
/// return the expected, mirrored order.
#[test]
fn ascending_and_descending_pagination_agree_on_contents() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path(), vec![TableSpec::new("widgets")]);
    let widgets = db.table("widgets").unwrap();
    for i in 0..10u8 {
        widgets.upsert(vec![i], vec![i]).unwrap();
    }

    let mut ascending = Vec::new();
    let mut cursor: Option<Vec<u8>> = None;
    loop {
        let mut opts = ScanOptions::new(3);
        if let Some(c) = cursor.clone() {
            opts = opts.after(c);
        }
        let page = widgets.range_scan(&[], &[], opts).unwrap();
        if page.is_empty() {
            break;
        }
        cursor = Some(page.last().unwrap().0.clone());
        ascending.extend(page);
    }

    let descending = widgets.range_scan(&[], &[], ScanOptions::new(10).descending()).unwrap();
    let mut expected_descending = ascending.clone();
    expected_descending.reverse();

    assert_eq!(ascending.len(), 10);
    assert_eq!(descending, expected_descending);
}
