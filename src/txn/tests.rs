use super::*;
use crate::wal::WalWriterConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

#[test]
fn successful_commit_runs_applies_and_writes_wal() {
    let dir = tempdir().unwrap();
    let wal = WalWriter::open(dir.path(), WalWriterConfig::default()).unwrap();

    let mut txn = Transaction::new(1);
    txn.add_put("users", b"k1".to_vec(), b"v1".to_vec());
    let applied = Arc::new(AtomicBool::new(false));
    let applied_clone = Arc::clone(&applied);
    txn.add_apply(move || applied_clone.store(true, Ordering::SeqCst));

    txn.commit(&wal, Durability::Safe).unwrap();
    assert!(applied.load(Ordering::SeqCst));

    drop(wal);
    let result = crate::wal::scan(dir.path().join(crate::wal::WAL_FILE_NAME)).unwrap();
    assert_eq!(result.committed_ops.len(), 1);
}

#[test]
fn rollback_runs_in_reverse_order_on_commit_failure() {
    let dir = tempdir().unwrap();
    let wal = WalWriter::open(dir.path(), WalWriterConfig::default()).unwrap();

    // Force the Paranoid fsync-parent-directory step to fail by removing
    // the directory out from under the writer after it has opened the WAL
    // file.
    std::fs::remove_dir_all(dir.path()).unwrap();

    let mut txn = Transaction::new(2);
    txn.add_put("users", b"k1".to_vec(), b"v1".to_vec());
    txn.add_apply(|| panic!("apply must not run when commit fails"));

    let order = Arc::new(Mutex::new(Vec::new()));
    let o1 = Arc::clone(&order);
    txn.add_rollback(move || o1.lock().unwrap().push("first"));
    let o2 = Arc::clone(&order);
    txn.add_rollback(move || o2.lock().unwrap().push("second"));

    let result = txn.commit(&wal, Durability::Paranoid);
    assert!(result.is_err());
    assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);
}

#[test]
fn empty_transaction_commits_cleanly() {
    let dir = tempdir().unwrap();
    let wal = WalWriter::open(dir.path(), WalWriterConfig::default()).unwrap();
    let txn = Transaction::new(1);
    assert!(txn.is_empty());
    txn.commit(&wal, Durability::None).unwrap();
}
