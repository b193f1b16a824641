//! Cross-restart and equivalence properties through the public surface.

use limestone::{Datastore, DatastoreConfig, LogEntry, Snapshot, WriteVersion};
use std::path::Path;

fn open(dir: &Path) -> Datastore {
    Datastore::new(DatastoreConfig::for_testing(dir)).unwrap()
}

fn normal(storage: u64, key: &[u8], value: &[u8], wv: (u64, u64)) -> LogEntry {
    LogEntry::Normal {
        storage,
        key: key.to_vec(),
        value: value.to_vec(),
        write_version: WriteVersion::new(wv.0, wv.1),
    }
}

fn scan(snapshot: &Snapshot) -> Vec<(u64, Vec<u8>, Vec<u8>)> {
    let mut cursor = snapshot.get_cursor().unwrap();
    let mut out = Vec::new();
    let mut key = Vec::new();
    let mut value = Vec::new();
    while cursor.next().unwrap() {
        cursor.key(&mut key);
        cursor.value(&mut value);
        out.push((cursor.storage(), key.clone(), value.clone()));
    }
    out
}

#[test]
fn test_durable_epoch_is_non_decreasing_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let mut observed = 0;
    for round in 1..=4u64 {
        let datastore = open(dir.path());
        assert!(
            datastore.durable_epoch() >= observed,
            "recovered durable epoch regressed in round {}",
            round
        );
        datastore.ready().unwrap();
        let channel = datastore.create_channel().unwrap();

        let epoch = round * 10;
        datastore.switch_epoch(epoch).unwrap();
        channel.begin_session(epoch, None).unwrap();
        channel
            .add_entry(normal(1, b"k", format!("round{}", round).as_bytes(), (epoch, 0)))
            .unwrap();
        channel.end_session().unwrap();

        observed = datastore.durable_epoch();
        assert_eq!(observed, epoch);
        datastore.shutdown().unwrap();
    }
}

#[test]
fn test_compaction_twice_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let datastore = open(dir.path());
    datastore.ready().unwrap();
    let channel = datastore.create_channel().unwrap();

    datastore.switch_epoch(1).unwrap();
    channel.begin_session(1, None).unwrap();
    for i in 0..100u64 {
        channel
            .add_entry(normal(1, format!("key{:03}", i).as_bytes(), b"v", (1, i)))
            .unwrap();
    }
    channel.end_session().unwrap();

    let first = datastore.compact_now().unwrap();
    let view_after_first = scan(&datastore.get_snapshot().unwrap());

    let second = datastore.compact_now().unwrap();
    assert_eq!(second.max_epoch_id, first.max_epoch_id);
    assert!(second.compacted_file.is_none(), "nothing new to compact");
    assert_eq!(scan(&datastore.get_snapshot().unwrap()), view_after_first);
}

#[test]
fn test_partitioned_cursors_visit_exactly_the_full_scan() {
    let dir = tempfile::tempdir().unwrap();
    let datastore = open(dir.path());
    datastore.ready().unwrap();
    let channel = datastore.create_channel().unwrap();

    datastore.switch_epoch(1).unwrap();
    channel.begin_session(1, None).unwrap();
    for i in 0..400u64 {
        channel
            .add_entry(normal(
                1 + i % 3,
                format!("key{:04}", i).as_bytes(),
                &vec![b'x'; 24],
                (1, i),
            ))
            .unwrap();
    }
    channel.end_session().unwrap();

    let snapshot = datastore.get_snapshot().unwrap();
    let full = scan(&snapshot);
    assert_eq!(full.len(), 400);

    for count in [1usize, 2, 4, 9] {
        let cursors = snapshot.get_partitioned_cursors(count).unwrap();
        assert!(cursors.len() <= count);
        let mut union = Vec::new();
        let mut key = Vec::new();
        let mut value = Vec::new();
        for mut cursor in cursors {
            while cursor.next().unwrap() {
                cursor.key(&mut key);
                cursor.value(&mut value);
                union.push((cursor.storage(), key.clone(), value.clone()));
            }
        }
        assert_eq!(union, full, "partition count {}", count);
    }
}

#[test]
fn test_blob_entries_round_trip_with_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let datastore = open(dir.path());
    datastore.ready().unwrap();
    let channel = datastore.create_channel().unwrap();

    datastore.switch_epoch(1).unwrap();
    channel.begin_session(1, None).unwrap();
    channel
        .add_entry(LogEntry::NormalWithBlob {
            storage: 1,
            key: b"big".to_vec(),
            blob_ids: vec![0x0102, 0x0304],
            write_version: WriteVersion::new(1, 0),
        })
        .unwrap();
    channel.end_session().unwrap();

    let snapshot = datastore.get_snapshot().unwrap();
    let mut cursor = snapshot.get_cursor().unwrap();
    assert!(cursor.next().unwrap());
    assert_eq!(cursor.blob_ids(), &[0x0102, 0x0304]);

    let resolver = datastore.blob_resolver();
    for id in cursor.blob_ids() {
        let path = resolver.resolve(*id);
        assert!(path.starts_with(dir.path().join("blob")));
    }
    assert!(!cursor.next().unwrap());
}
