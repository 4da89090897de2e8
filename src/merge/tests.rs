use super::*;
use crate::memtable::MemTable;
use crate::sstable::{SstReader, SstWriter};
use tempfile::tempdir;

fn write_sst(dir: &std::path::Path, name: &str, records: Vec<(Vec<u8>, Option<Vec<u8>>)>) -> SstReader {
    let data_path = dir.join(name);
    let sxi_path = dir.join(format!("{name}.sxi"));
    SstWriter::write(&data_path, &sxi_path, records, 4).unwrap();
    SstReader::open(&data_path).unwrap()
}

#[test]
fn merged_sst_stream_prefers_first_iterator_on_tie() {
    let dir = tempdir().unwrap();
    let newer = write_sst(dir.path(), "newer.sst", vec![(vec![1], Some(vec![b'n']))]);
    let older = write_sst(
        dir.path(),
        "older.sst",
        vec![(vec![1], Some(vec![b'o'])), (vec![2], Some(vec![b'o']))],
    );

    let merged: Vec<_> = MergedSstStream::new(vec![
        newer.scan_range(&[], &[]),
        older.scan_range(&[], &[]),
    ])
    .collect::<Result<_, _>>()
    .unwrap();

    assert_eq!(merged, vec![(vec![1], Some(vec![b'n'])), (vec![2], Some(vec![b'o']))]);
}

#[test]
fn merged_sst_stream_tombstone_in_newer_masks_older_value() {
    let dir = tempdir().unwrap();
    let newer = write_sst(dir.path(), "newer.sst", vec![(vec![1], None)]);
    let older = write_sst(dir.path(), "older.sst", vec![(vec![1], Some(vec![b'o']))]);

    let merged: Vec<_> = MergedSstStream::new(vec![newer.scan_range(&[], &[]), older.scan_range(&[], &[])])
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(merged, vec![(vec![1], None)]);
}

#[test]
fn memtable_wins_over_sst_at_equal_key() {
    let dir = tempdir().unwrap();
    let sst = write_sst(dir.path(), "a.sst", vec![(vec![1], Some(vec![b'd']))]);
    let mt = MemTable::new();
    mt.upsert(vec![1], vec![b'm']).unwrap();
    let snap = mt.snapshot_all().unwrap();

    let merged: Vec<_> = MergeReader::new(snap, sst.scan_range(&[], &[])).collect::<Result<_, _>>().unwrap();
    assert_eq!(merged, vec![(vec![1], vec![b'm'])]);
}

#[test]
fn memtable_tombstone_masks_sst_entry() {
    let dir = tempdir().unwrap();
    let sst = write_sst(dir.path(), "a.sst", vec![(vec![1], Some(vec![b'd']))]);
    let mt = MemTable::new();
    mt.delete(vec![1]).unwrap();
    let snap = mt.snapshot_all().unwrap();

    let merged: Vec<_> = MergeReader::new(snap, sst.scan_range(&[], &[])).collect::<Result<_, _>>().unwrap();
    assert!(merged.is_empty());
}

#[test]
fn sst_tombstone_masks_older_sst_entry_in_full_merge() {
    let dir = tempdir().unwrap();
    let newer = write_sst(dir.path(), "newer.sst", vec![(vec![1], None)]);
    let older = write_sst(dir.path(), "older.sst", vec![(vec![1], Some(vec![b'o']))]);
    let merged_ssts = MergedSstStream::new(vec![newer.scan_range(&[], &[]), older.scan_range(&[], &[])]);
    let mt = MemTable::new();
    let snap = mt.snapshot_all().unwrap();

    let merged: Vec<_> = MergeReader::new(snap, merged_ssts).collect::<Result<_, _>>().unwrap();
    assert!(merged.is_empty());
}

#[test]
fn disjoint_keys_interleave_in_order() {
    let dir = tempdir().unwrap();
    let sst = write_sst(
        dir.path(),
        "a.sst",
        vec![(vec![1], Some(vec![b'a'])), (vec![3], Some(vec![b'a']))],
    );
    let mt = MemTable::new();
    mt.upsert(vec![2], vec![b'm']).unwrap();
    let snap = mt.snapshot_all().unwrap();

    let merged: Vec<_> = MergeReader::new(snap, sst.scan_range(&[], &[])).collect::<Result<_, _>>().unwrap();
    assert_eq!(merged, vec![(vec![1], vec![b'a']), (vec![2], vec![b'm']), (vec![3], vec![b'a'])]);
}

#[test]
fn cancellation_token_stops_iteration() {
    let dir = tempdir().unwrap();
    let sst = write_sst(dir.path(), "a.sst", vec![(vec![1], Some(vec![1])), (vec![2], Some(vec![2]))]);
    let mt = MemTable::new();
    let snap = mt.snapshot_all().unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let mut reader = MergeReader::new(snap, sst.scan_range(&[], &[])).with_cancellation(token);
    assert!(matches!(reader.next(), Some(Err(MergeError::Cancelled))));
}

#[test]
fn read_page_yields_bounded_chunks() {
    let dir = tempdir().unwrap();
    let sst = write_sst(
        dir.path(),
        "a.sst",
        (0..10u8).map(|i| (vec![i], Some(vec![i]))).collect(),
    );
    let mt = MemTable::new();
    let snap = mt.snapshot_all().unwrap();
    let mut reader = MergeReader::new(snap, sst.scan_range(&[], &[]));

    let page1 = read_page(&mut reader, 4).unwrap();
    assert_eq!(page1.len(), 4);
    let page2 = read_page(&mut reader, 4).unwrap();
    assert_eq!(page2.len(), 4);
    let page3 = read_page(&mut reader, 4).unwrap();
    assert_eq!(page3.len(), 2);
}
