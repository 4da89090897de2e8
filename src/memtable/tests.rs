use super::*;

#[test]
fn upsert_then_get_returns_value() {
    let mt = MemTable::new();
    mt.upsert(b"k1".to_vec(), b"v1".to_vec()).unwrap();
    let entry = mt.try_get(b"k1").unwrap().unwrap();
    assert!(!entry.tombstone);
    assert_eq!(entry.value, Some(b"v1".to_vec()));
}

#[test]
fn missing_key_returns_none() {
    let mt = MemTable::new();
    assert!(mt.try_get(b"nope").unwrap().is_none());
}

#[test]
fn delete_masks_prior_value_with_tombstone() {
    let mt = MemTable::new();
    mt.upsert(b"k1".to_vec(), b"v1".to_vec()).unwrap();
    mt.delete(b"k1".to_vec()).unwrap();
    let entry = mt.try_get(b"k1").unwrap().unwrap();
    assert!(entry.tombstone);
    assert_eq!(entry.value, None);
    assert!(mt.has_tombstone_exact(b"k1").unwrap());
}

#[test]
fn upsert_after_delete_clears_tombstone() {
    let mt = MemTable::new();
    mt.delete(b"k1".to_vec()).unwrap();
    mt.upsert(b"k1".to_vec(), b"v2".to_vec()).unwrap();
    let entry = mt.try_get(b"k1").unwrap().unwrap();
    assert!(!entry.tombstone);
    assert_eq!(entry.value, Some(b"v2".to_vec()));
}

#[test]
fn snapshot_range_is_ordered_and_bounded() {
    let mt = MemTable::new();
    for i in 0..10u8 {
        mt.upsert(vec![i], vec![i * 2]).unwrap();
    }
    let snap = mt.snapshot_range(&[3], &[7], None).unwrap();
    let keys: Vec<u8> = snap.map(|(k, _)| k[0]).collect();
    assert_eq!(keys, vec![3, 4, 5, 6]);
}

#[test]
fn snapshot_range_unbounded_sides() {
    let mt = MemTable::new();
    for i in 0..5u8 {
        mt.upsert(vec![i], vec![]).unwrap();
    }
    let snap = mt.snapshot_range(&[], &[], None).unwrap();
    let keys: Vec<u8> = snap.map(|(k, _)| k[0]).collect();
    assert_eq!(keys, vec![0, 1, 2, 3, 4]);
}

#[test]
fn snapshot_range_after_exclusive_cursor() {
    let mt = MemTable::new();
    for i in 0..5u8 {
        mt.upsert(vec![i], vec![]).unwrap();
    }
    let snap = mt.snapshot_range(&[], &[], Some(&[1])).unwrap();
    let keys: Vec<u8> = snap.map(|(k, _)| k[0]).collect();
    assert_eq!(keys, vec![2, 3, 4]);
}

#[test]
fn snapshot_is_stable_once_taken() {
    let mt = MemTable::new();
    mt.upsert(b"k1".to_vec(), b"v1".to_vec()).unwrap();
    let snap = mt.snapshot_all().unwrap();
    mt.upsert(b"k2".to_vec(), b"v2".to_vec()).unwrap();
    let keys: Vec<Vec<u8>> = snap.map(|(k, _)| k).collect();
    assert_eq!(keys, vec![b"k1".to_vec()]);
}

#[test]
fn is_empty_reflects_writes() {
    let mt = MemTable::new();
    assert!(mt.is_empty().unwrap());
    mt.upsert(b"k".to_vec(), b"v".to_vec()).unwrap();
    assert!(!mt.is_empty().unwrap());
}

#[test]
fn snapshot_range_rejects_reversed_bounds_instead_of_panicking() {
    let mt = MemTable::new();
    mt.upsert(vec![5], vec![]).unwrap();
    let err = mt.snapshot_range(&[7], &[3], None).unwrap_err();
    assert!(matches!(err, MemTableError::InvalidArgument(_)));
}

#[test]
fn snapshot_range_rejects_reversed_bounds_after_cursor_shift() {
    let mt = MemTable::new();
    mt.upsert(vec![5], vec![]).unwrap();
    // `after_exclusive` pushes the effective lower bound past `to_exclusive`.
    let err = mt.snapshot_range(&[1], &[3], Some(&[7])).unwrap_err();
    assert!(matches!(err, MemTableError::InvalidArgument(_)));
}
