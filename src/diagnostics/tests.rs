use super::*;
use crate::db::{Database, WalnutConfig};
use crate::sstable::{SstReader, SstWriter};
use crate::table::TableSpec;
use crate::wal::{Durability, WalWriter, WalWriterConfig};
use tempfile::tempdir;

#[test]
fn scan_wal_reports_frame_counts_and_touched_tables() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path(), WalnutConfig::default(), vec![TableSpec::new("items")]).unwrap();
    let items = db.table("items").unwrap();
    items.upsert(b"k1".to_vec(), b"v1".to_vec()).unwrap();
    items.upsert(b"k2".to_vec(), b"v2".to_vec()).unwrap();
    items.delete(b"k1").unwrap();
    db.close().unwrap();

    let report = scan_wal(dir.path().join(crate::wal::WAL_FILE_NAME)).unwrap();
    assert_eq!(report.put_count, 2);
    assert_eq!(report.delete_count, 1);
    assert_eq!(report.tables, vec!["items".to_string()]);
    assert!(!report.needs_truncation);
    assert!(report.pending_tx_ids.is_empty());
}

#[test]
fn scan_wal_flags_a_transaction_with_no_matching_commit() {
    let dir = tempdir().unwrap();
    let wal = WalWriter::open(dir.path(), WalWriterConfig::default()).unwrap();
    // A Begin with no Commit: simulates a crash mid-transaction.
    wal.append_transaction(&[crate::wal::WalFrame::Begin { tx_id: 7 }], Durability::Safe).unwrap();
    drop(wal);

    let report = scan_wal(dir.path().join(crate::wal::WAL_FILE_NAME)).unwrap();
    assert_eq!(report.pending_tx_ids, vec![7]);
}

#[test]
fn validate_sst_dir_reports_valid_and_corrupt_files() {
    let dir = tempdir().unwrap();
    let data_path = dir.path().join("0-good.sst");
    let sxi_path = crate::sstable::sparse_index_path(&data_path);
    SstWriter::write(&data_path, &sxi_path, vec![(vec![1], Some(vec![9]))], 1024).unwrap();

    let corrupt_path = dir.path().join("1-bad.sst");
    std::fs::write(&corrupt_path, b"not an sst file").unwrap();

    let reports = validate_sst_dir(dir.path()).unwrap();
    assert_eq!(reports.len(), 2);

    let good = reports.iter().find(|r| r.path == data_path).unwrap();
    assert!(matches!(good.status, SstFileStatus::Valid { record_count: 1 }));

    let bad = reports.iter().find(|r| r.path == corrupt_path).unwrap();
    assert!(matches!(bad.status, SstFileStatus::Corrupt { .. }));

    // Sanity check that the good file really does open cleanly on its own.
    assert!(SstReader::open(&data_path).is_ok());
}
