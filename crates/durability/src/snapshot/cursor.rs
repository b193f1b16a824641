//! Cursors over sorted entry files.
//!
//! A cursor streams one snapshot file and, optionally, the latest compacted
//! file, merging the two by (storage, key). Where both sides hold the same
//! key the greater write version wins (the snapshot side wins exact ties,
//! being the newer artifact). Tombstones and records covered by a
//! clear-storage version are filtered out here, which is what turns the
//! retained-tombstone artifacts into the observable snapshot.
//!
//! Clear records are consumed while streaming: a sorted file places each
//! storage's clear record ahead of that storage's keys, so by the time a
//! key is merged, every clear that could suppress it has been seen. The
//! compacted side always streams from the start of its file and therefore
//! carries a superset of the snapshot side's clear records, which is what
//! makes it safe for the snapshot side to seek past its own.

use limestone_core::{BlobId, Error, LogEntry, Result, StorageId, WriteVersion};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::format::EntryReader;
use crate::snapshot::file::open_reader_at;
use crate::snapshot::registry::RegistryGuard;
use crate::snapshot::EntryKey;

/// One side of the merge: a sorted file being streamed.
pub(crate) struct SideReader {
    reader: EntryReader<BufReader<File>>,
    path: PathBuf,
    peeked: Option<LogEntry>,
    finished: bool,
}

impl SideReader {
    pub(crate) fn open(path: &Path, offset: u64) -> Result<Self> {
        Ok(SideReader {
            reader: open_reader_at(path, offset)?,
            path: path.to_path_buf(),
            peeked: None,
            finished: false,
        })
    }

    /// Advance to the next value entry, folding clear records into
    /// `clears` along the way.
    fn peek(
        &mut self,
        clears: &mut BTreeMap<StorageId, WriteVersion>,
    ) -> Result<Option<&LogEntry>> {
        while self.peeked.is_none() && !self.finished {
            match self
                .reader
                .read_entry()
                .map_err(|e| e.into_error(&self.path))?
            {
                Some(LogEntry::ClearStorage {
                    storage,
                    write_version,
                }) => {
                    let slot = clears.entry(storage).or_insert(write_version);
                    if write_version > *slot {
                        *slot = write_version;
                    }
                }
                Some(LogEntry::AddStorage { .. }) | Some(LogEntry::RemoveStorage { .. }) => {}
                Some(entry) if entry.is_value_entry() => self.peeked = Some(entry),
                Some(marker) => {
                    return Err(Error::invariant(format!(
                        "session marker {:?} in sorted file {}",
                        marker,
                        self.path.display()
                    )))
                }
                None => self.finished = true,
            }
        }
        Ok(self.peeked.as_ref())
    }

    fn peeked_key(&self) -> Option<EntryKey> {
        self.peeked.as_ref().map(entry_key)
    }

    fn peeked_version(&self) -> Option<WriteVersion> {
        self.peeked.as_ref().and_then(|e| e.write_version())
    }

    fn take(&mut self) -> LogEntry {
        self.peeked.take().expect("peeked entry present")
    }

    fn discard(&mut self) {
        self.peeked = None;
    }

    /// Drop entries ahead of `bound` (or at it when `inclusive` is false).
    fn skip_until(
        &mut self,
        clears: &mut BTreeMap<StorageId, WriteVersion>,
        bound: &EntryKey,
        inclusive: bool,
    ) -> Result<()> {
        while let Some(entry) = self.peek(clears)? {
            let key = entry_key(entry);
            let before_bound = if inclusive { key < *bound } else { key <= *bound };
            if before_bound {
                self.discard();
            } else {
                break;
            }
        }
        Ok(())
    }
}

fn entry_key(entry: &LogEntry) -> EntryKey {
    (
        entry.storage().expect("value entries carry a storage"),
        entry.key().expect("value entries carry a key").to_vec(),
    )
}

/// The record a cursor is positioned on.
struct CurrentRecord {
    storage: StorageId,
    key: Vec<u8>,
    value: Vec<u8>,
    blob_ids: Vec<BlobId>,
    write_version: WriteVersion,
}

impl CurrentRecord {
    fn from_entry(entry: LogEntry) -> Self {
        match entry {
            LogEntry::Normal {
                storage,
                key,
                value,
                write_version,
            } => CurrentRecord {
                storage,
                key,
                value,
                blob_ids: Vec::new(),
                write_version,
            },
            LogEntry::NormalWithBlob {
                storage,
                key,
                blob_ids,
                write_version,
            } => CurrentRecord {
                storage,
                key,
                value: Vec::new(),
                blob_ids,
                write_version,
            },
            other => unreachable!("cursor emitted non-record entry {:?}", other),
        }
    }
}

/// Pull iterator over the merged, filtered snapshot view.
///
/// The accessors are valid only while the cursor is positioned on a record,
/// i.e. after `next()` returned `true`.
pub struct Cursor {
    snapshot: SideReader,
    compacted: Option<SideReader>,
    clears: BTreeMap<StorageId, WriteVersion>,
    current: Option<CurrentRecord>,
    /// Exclusive end bound, used by partitioned cursors.
    upper: Option<EntryKey>,
    /// Point-lookup target: the first merged record must equal it.
    exact: Option<EntryKey>,
    done: bool,
    _guards: Vec<RegistryGuard>,
}

impl Cursor {
    pub(crate) fn new(
        snapshot: SideReader,
        compacted: Option<SideReader>,
        guards: Vec<RegistryGuard>,
    ) -> Self {
        Cursor {
            snapshot,
            compacted,
            clears: BTreeMap::new(),
            current: None,
            upper: None,
            exact: None,
            done: false,
            _guards: guards,
        }
    }

    /// Skip both sides forward to `bound`.
    pub(crate) fn position(&mut self, bound: &EntryKey, inclusive: bool) -> Result<()> {
        self.snapshot
            .skip_until(&mut self.clears, bound, inclusive)?;
        if let Some(compacted) = &mut self.compacted {
            compacted.skip_until(&mut self.clears, bound, inclusive)?;
        }
        Ok(())
    }

    pub(crate) fn set_upper_bound(&mut self, bound: EntryKey) {
        self.upper = Some(bound);
    }

    pub(crate) fn set_exact_match(&mut self, target: EntryKey) {
        self.exact = Some(target);
    }

    /// Advance to the next record. Returns `false` at the end of the
    /// cursor's range.
    pub fn next(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        loop {
            let snapshot_key = {
                self.snapshot.peek(&mut self.clears)?;
                self.snapshot.peeked_key()
            };
            let compacted_key = match &mut self.compacted {
                Some(side) => {
                    side.peek(&mut self.clears)?;
                    side.peeked_key()
                }
                None => None,
            };

            let winner = match (snapshot_key, compacted_key) {
                (None, None) => {
                    self.done = true;
                    self.current = None;
                    return Ok(false);
                }
                (Some(_), None) => self.snapshot.take(),
                (None, Some(_)) => self.compacted.as_mut().expect("side present").take(),
                (Some(s_key), Some(c_key)) => {
                    if s_key < c_key {
                        self.snapshot.take()
                    } else if c_key < s_key {
                        self.compacted.as_mut().expect("side present").take()
                    } else {
                        // Same key on both sides: greater write version
                        // wins, the snapshot side wins ties.
                        let compacted = self.compacted.as_mut().expect("side present");
                        if compacted.peeked_version() > self.snapshot.peeked_version() {
                            self.snapshot.discard();
                            compacted.take()
                        } else {
                            compacted.discard();
                            self.snapshot.take()
                        }
                    }
                }
            };

            let key = entry_key(&winner);
            if let Some(upper) = &self.upper {
                if key >= *upper {
                    self.done = true;
                    self.current = None;
                    return Ok(false);
                }
            }
            if let Some(target) = &self.exact {
                if key != *target {
                    self.done = true;
                    self.current = None;
                    return Ok(false);
                }
            }

            let write_version = winner.write_version().expect("records carry a version");
            if let Some(clear_version) = self.clears.get(&key.0) {
                if write_version <= *clear_version {
                    continue;
                }
            }
            if matches!(winner, LogEntry::RemoveEntry { .. }) {
                continue;
            }

            if self.exact.is_some() {
                // A point lookup yields at most one record.
                self.done = true;
            }
            self.current = Some(CurrentRecord::from_entry(winner));
            return Ok(true);
        }
    }

    /// Storage id of the current record.
    pub fn storage(&self) -> StorageId {
        self.current
            .as_ref()
            .expect("cursor is positioned on a record")
            .storage
    }

    /// Copy the current record's key into `buf`.
    pub fn key(&self, buf: &mut Vec<u8>) {
        let current = self
            .current
            .as_ref()
            .expect("cursor is positioned on a record");
        buf.clear();
        buf.extend_from_slice(&current.key);
    }

    /// Copy the current record's value into `buf`. Empty for blob records.
    pub fn value(&self, buf: &mut Vec<u8>) {
        let current = self
            .current
            .as_ref()
            .expect("cursor is positioned on a record");
        buf.clear();
        buf.extend_from_slice(&current.value);
    }

    /// Blob ids of the current record; empty for inline values.
    pub fn blob_ids(&self) -> &[BlobId] {
        self.current
            .as_ref()
            .expect("cursor is positioned on a record")
            .blob_ids
            .as_slice()
    }

    /// Write version of the current record.
    pub fn write_version(&self) -> WriteVersion {
        self.current
            .as_ref()
            .expect("cursor is positioned on a record")
            .write_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::file::SortedFileWriter;
    use limestone_core::LogEntry;

    fn normal(storage: StorageId, key: &[u8], value: &[u8], wv: (u64, u64)) -> LogEntry {
        LogEntry::Normal {
            storage,
            key: key.to_vec(),
            value: value.to_vec(),
            write_version: WriteVersion::new(wv.0, wv.1),
        }
    }

    fn write_sorted(path: &Path, entries: &[LogEntry]) {
        let mut writer = SortedFileWriter::create(path).unwrap();
        for e in entries {
            writer.write(e).unwrap();
        }
        writer.finish().unwrap();
    }

    fn collect(cursor: &mut Cursor) -> Vec<(StorageId, Vec<u8>, Vec<u8>)> {
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

    fn single(path: &Path) -> Cursor {
        Cursor::new(SideReader::open(path, 0).unwrap(), None, Vec::new())
    }

    fn merged(snapshot: &Path, compacted: &Path) -> Cursor {
        Cursor::new(
            SideReader::open(snapshot, 0).unwrap(),
            Some(SideReader::open(compacted, 0).unwrap()),
            Vec::new(),
        )
    }

    #[test]
    fn test_single_side_scan_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot");
        write_sorted(
            &path,
            &[
                normal(1, b"a", b"1", (5, 0)),
                normal(1, b"b", b"2", (5, 1)),
                normal(2, b"a", b"3", (5, 2)),
            ],
        );

        let mut cursor = single(&path);
        assert_eq!(
            collect(&mut cursor),
            vec![
                (1, b"a".to_vec(), b"1".to_vec()),
                (1, b"b".to_vec(), b"2".to_vec()),
                (2, b"a".to_vec(), b"3".to_vec()),
            ]
        );
        assert!(!cursor.next().unwrap(), "stays exhausted");
    }

    #[test]
    fn test_merge_prefers_greater_write_version() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("snapshot");
        let compacted = dir.path().join("compacted");
        write_sorted(
            &snapshot,
            &[normal(1, b"a", b"new", (6, 0)), normal(1, b"c", b"s", (6, 1))],
        );
        write_sorted(
            &compacted,
            &[normal(1, b"a", b"old", (5, 0)), normal(1, b"b", b"c", (5, 1))],
        );

        let mut cursor = merged(&snapshot, &compacted);
        assert_eq!(
            collect(&mut cursor),
            vec![
                (1, b"a".to_vec(), b"new".to_vec()),
                (1, b"b".to_vec(), b"c".to_vec()),
                (1, b"c".to_vec(), b"s".to_vec()),
            ]
        );
    }

    #[test]
    fn test_newer_compacted_side_wins() {
        // Online compaction can put fresher records in the compacted file
        // than the snapshot holds.
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("snapshot");
        let compacted = dir.path().join("compacted");
        write_sorted(&snapshot, &[normal(1, b"a", b"stale", (5, 0))]);
        write_sorted(&compacted, &[normal(1, b"a", b"fresh", (7, 0))]);

        let mut cursor = merged(&snapshot, &compacted);
        assert_eq!(
            collect(&mut cursor),
            vec![(1, b"a".to_vec(), b"fresh".to_vec())]
        );
    }

    #[test]
    fn test_tombstone_suppresses_across_sides() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("snapshot");
        let compacted = dir.path().join("compacted");
        write_sorted(
            &snapshot,
            &[
                LogEntry::RemoveEntry {
                    storage: 1,
                    key: b"a".to_vec(),
                    write_version: WriteVersion::new(6, 0),
                },
                normal(1, b"b", b"kept", (6, 1)),
            ],
        );
        write_sorted(&compacted, &[normal(1, b"a", b"dead", (5, 0))]);

        let mut cursor = merged(&snapshot, &compacted);
        assert_eq!(
            collect(&mut cursor),
            vec![(1, b"b".to_vec(), b"kept".to_vec())]
        );
    }

    #[test]
    fn test_clear_record_suppresses_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("snapshot");
        let compacted = dir.path().join("compacted");
        write_sorted(
            &snapshot,
            &[
                LogEntry::ClearStorage {
                    storage: 1,
                    write_version: WriteVersion::new(6, 0),
                },
                normal(1, b"b", b"new", (6, 1)),
            ],
        );
        write_sorted(
            &compacted,
            &[normal(1, b"a", b"old", (5, 0)), normal(2, b"x", b"other", (5, 1))],
        );

        let mut cursor = merged(&snapshot, &compacted);
        assert_eq!(
            collect(&mut cursor),
            vec![
                (1, b"b".to_vec(), b"new".to_vec()),
                (2, b"x".to_vec(), b"other".to_vec()),
            ]
        );
    }

    #[test]
    fn test_blob_record_exposes_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot");
        write_sorted(
            &path,
            &[LogEntry::NormalWithBlob {
                storage: 1,
                key: b"a".to_vec(),
                blob_ids: vec![3, 9],
                write_version: WriteVersion::new(5, 0),
            }],
        );

        let mut cursor = single(&path);
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.blob_ids(), &[3, 9]);
        let mut value = Vec::new();
        cursor.value(&mut value);
        assert!(value.is_empty());
    }

    #[test]
    fn test_exact_match_yields_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot");
        write_sorted(
            &path,
            &[
                normal(1, b"a", b"1", (5, 0)),
                normal(1, b"b", b"2", (5, 1)),
                normal(1, b"c", b"3", (5, 2)),
            ],
        );

        let mut cursor = single(&path);
        let target: EntryKey = (1, b"b".to_vec());
        cursor.position(&target, true).unwrap();
        cursor.set_exact_match(target);
        assert!(cursor.next().unwrap());
        let mut key = Vec::new();
        cursor.key(&mut key);
        assert_eq!(key, b"b");
        assert!(!cursor.next().unwrap());
    }

    #[test]
    fn test_exact_match_misses_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot");
        write_sorted(
            &path,
            &[normal(1, b"a", b"1", (5, 0)), normal(1, b"c", b"3", (5, 2))],
        );

        let mut cursor = single(&path);
        let target: EntryKey = (1, b"b".to_vec());
        cursor.position(&target, true).unwrap();
        cursor.set_exact_match(target);
        assert!(!cursor.next().unwrap());
    }

    #[test]
    fn test_bounds_limit_the_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot");
        write_sorted(
            &path,
            &[
                normal(1, b"a", b"1", (5, 0)),
                normal(1, b"b", b"2", (5, 1)),
                normal(1, b"c", b"3", (5, 2)),
                normal(1, b"d", b"4", (5, 3)),
            ],
        );

        let mut cursor = single(&path);
        cursor.position(&(1, b"b".to_vec()), true).unwrap();
        cursor.set_upper_bound((1, b"d".to_vec()));
        assert_eq!(
            collect(&mut cursor),
            vec![
                (1, b"b".to_vec(), b"2".to_vec()),
                (1, b"c".to_vec(), b"3".to_vec()),
            ]
        );
    }

    #[test]
    fn test_exclusive_position_skips_the_bound_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot");
        write_sorted(
            &path,
            &[normal(1, b"a", b"1", (5, 0)), normal(1, b"b", b"2", (5, 1))],
        );

        let mut cursor = single(&path);
        cursor.position(&(1, b"a".to_vec()), false).unwrap();
        assert_eq!(
            collect(&mut cursor),
            vec![(1, b"b".to_vec(), b"2".to_vec())]
        );
    }
}
