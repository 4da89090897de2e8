use super::*;
use crate::db::{Database, WalnutConfig};
use crate::wal::Durability;
use crate::Scalar;
use tempfile::tempdir;

fn email_extractor(payload: &[u8]) -> Vec<(String, Scalar)> {
    let text = std::str::from_utf8(payload).unwrap();
    text.split_once("email=")
        .map(|(_, rest)| vec![("email".to_string(), Scalar::Str(rest.to_string()))])
        .unwrap_or_default()
}

#[test]
fn upsert_then_get_then_delete() {
    let dir = tempdir().unwrap();
    let spec = TableSpec::new("users");
    let db = Database::open(dir.path(), WalnutConfig::default(), vec![spec]).unwrap();
    let users = db.table("users").unwrap();

    users.upsert(b"u1".to_vec(), b"alice".to_vec()).unwrap();
    assert_eq!(users.get(b"u1").unwrap(), Some(b"alice".to_vec()));

    users.upsert(b"u1".to_vec(), b"alice2".to_vec()).unwrap();
    assert_eq!(users.get(b"u1").unwrap(), Some(b"alice2".to_vec()));

    assert!(users.delete(b"u1").unwrap());
    assert_eq!(users.get(b"u1").unwrap(), None);
    assert!(!users.delete(b"u1").unwrap());
}

#[test]
fn unique_index_rejects_second_owner() {
    let dir = tempdir().unwrap();
    let spec = TableSpec::new("users")
        .with_index(IndexSpec::new("email").unique())
        .with_extractor(std::sync::Arc::new(email_extractor));
    let db = Database::open(dir.path(), WalnutConfig::default(), vec![spec]).unwrap();
    let users = db.table("users").unwrap();

    users.upsert(b"u1".to_vec(), b"email=a@b.com".to_vec()).unwrap();
    let err = users.upsert(b"u2".to_vec(), b"email=a@b.com".to_vec()).unwrap_err();
    assert!(matches!(err, TableError::UniqueViolation { .. }));

    // Re-assigning the same key to the same value is not a collision.
    users.upsert(b"u1".to_vec(), b"email=a@b.com".to_vec()).unwrap();

    // Freeing the old owner lets a new writer take the value.
    users.delete(b"u1").unwrap();
    users.upsert(b"u2".to_vec(), b"email=a@b.com".to_vec()).unwrap();
    assert_eq!(users.get(b"u2").unwrap(), Some(b"email=a@b.com".to_vec()));
}

#[test]
fn index_scan_resolves_to_current_primary_rows() {
    let dir = tempdir().unwrap();
    let spec = TableSpec::new("users")
        .with_index(IndexSpec::new("email"))
        .with_extractor(std::sync::Arc::new(email_extractor));
    let db = Database::open(dir.path(), WalnutConfig::default(), vec![spec]).unwrap();
    let users = db.table("users").unwrap();

    users.upsert(b"u1".to_vec(), b"email=a@b.com".to_vec()).unwrap();
    users.upsert(b"u2".to_vec(), b"email=z@z.com".to_vec()).unwrap();

    let prefix = crate::codec::IndexKeyCodec::encode(&Scalar::Str("a@b.com".to_string())).unwrap();
    let upper = crate::codec::IndexKeyCodec::prefix_upper_bound(&prefix);
    let found = users.index_scan("email", &prefix, &upper, ScanOptions::new(10)).unwrap();
    assert_eq!(found, vec![(b"u1".to_vec(), b"email=a@b.com".to_vec())]);
}

#[test]
fn range_scan_respects_ascending_and_descending_pagination() {
    let dir = tempdir().unwrap();
    let spec = TableSpec::new("items");
    let db = Database::open(dir.path(), WalnutConfig::default(), vec![spec]).unwrap();
    let items = db.table("items").unwrap();

    for i in 0..5u8 {
        items.upsert(vec![i], vec![i]).unwrap();
    }

    let asc = items.range_scan(&[], &[], ScanOptions::new(3)).unwrap();
    assert_eq!(asc, vec![(vec![0], vec![0]), (vec![1], vec![1]), (vec![2], vec![2])]);

    let desc = items.range_scan(&[], &[], ScanOptions::new(3).descending()).unwrap();
    assert_eq!(desc, vec![(vec![4], vec![4]), (vec![3], vec![3]), (vec![2], vec![2])]);

    let page2 = items.range_scan(&[], &[], ScanOptions::new(3).skip(3)).unwrap();
    assert_eq!(page2, vec![(vec![3], vec![3]), (vec![4], vec![4])]);
}

#[test]
fn delete_then_checkpoint_masks_older_sst_value() {
    let dir = tempdir().unwrap();
    let spec = TableSpec::new("items");
    let db = Database::open(dir.path(), WalnutConfig::default(), vec![spec]).unwrap();
    let items = db.table("items").unwrap();

    items.upsert(b"k".to_vec(), b"v".to_vec()).unwrap();
    db.checkpoint().unwrap();

    items.delete(b"k").unwrap();
    db.checkpoint().unwrap();

    assert_eq!(items.get(b"k").unwrap(), None);
}

#[test]
fn failed_commit_releases_a_won_unique_reservation() {
    let dir = tempdir().unwrap();
    let mut config = WalnutConfig::default();
    config.default_durability = Durability::Paranoid;
    let spec = TableSpec::new("accounts")
        .with_index(IndexSpec::new("email").unique())
        .with_extractor(std::sync::Arc::new(email_extractor));
    let db = Database::open(dir.path(), config, vec![spec]).unwrap();
    let accounts = db.table("accounts").unwrap();

    // Force the Paranoid fsync-parent-directory step to fail on the next
    // commit by removing the directory out from under the writer, the same
    // technique `txn::tests::rollback_runs_in_reverse_order_on_commit_failure`
    // uses.
    std::fs::remove_dir_all(dir.path()).unwrap();

    let err = accounts.upsert(b"u1".to_vec(), b"email=a@b.com".to_vec()).unwrap_err();
    assert!(matches!(err, TableError::Txn(_)), "expected a commit failure, got {err:?}");

    // The reservation won before the doomed commit must not outlive it: a
    // later writer needs to be able to claim the same value.
    let prefix = IndexKeyCodec::encode(&Scalar::Str("a@b.com".to_string())).unwrap();
    assert!(!accounts.guard.is_owner("email", &prefix, b"u1").unwrap());
}
