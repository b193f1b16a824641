//! Point-in-time snapshot access.
//!
//! A [`Snapshot`] handle wraps one sorted snapshot file (and optionally the
//! latest compacted file) and hands out cursors over it. The handle
//! registers its files with the cursor registry for as long as it lives, so
//! compaction GC never deletes files a reader may still open.

mod builder;
mod cursor;
mod file;
mod registry;

pub use builder::{BuildStats, SnapshotBuilder};
pub use cursor::Cursor;
pub use file::{SnapshotIndex, SortedFileWriter};
pub use registry::{CursorRegistry, RegistryGuard};

use limestone_core::{Result, StorageId};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::paths;
use crate::snapshot::cursor::SideReader;

/// Merge/sort key of a record: storage id, then key bytes.
pub(crate) type EntryKey = (StorageId, Vec<u8>);

/// A snapshot of the data at a point in time on the datastore.
pub struct Snapshot {
    snapshot_path: PathBuf,
    compacted_path: Option<PathBuf>,
    index: SnapshotIndex,
    registry: Arc<CursorRegistry>,
    _guards: Vec<RegistryGuard>,
}

impl Snapshot {
    /// Directory name a snapshot lives in, under the data location.
    pub const SUBDIRECTORY_NAME: &'static str = paths::SNAPSHOT_DIR_NAME;

    /// File name of a snapshot inside [`Snapshot::SUBDIRECTORY_NAME`].
    pub const FILE_NAME: &'static str = paths::SNAPSHOT_FILE_NAME;

    /// Open a snapshot file, indexing it once for seeks and partition
    /// splits. When `compacted_path` is given, cursors merge it in.
    pub fn open(
        snapshot_path: PathBuf,
        compacted_path: Option<PathBuf>,
        registry: Arc<CursorRegistry>,
        index_sample_interval: u64,
    ) -> Result<Self> {
        let index = SnapshotIndex::build(&snapshot_path, index_sample_interval)?;
        let mut guards = vec![registry.acquire(&snapshot_path)];
        if let Some(compacted) = &compacted_path {
            guards.push(registry.acquire(compacted));
        }
        Ok(Snapshot {
            snapshot_path,
            compacted_path,
            index,
            registry,
            _guards: guards,
        })
    }

    /// Path of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Total bytes of snapshot payload.
    pub fn size_bytes(&self) -> u64 {
        self.index.total_bytes()
    }

    /// Cursor over the full snapshot, first record reached by `next()`.
    pub fn get_cursor(&self) -> Result<Cursor> {
        self.make_cursor(None)
    }

    /// Cursor positioned such that `next()` yields exactly the record at
    /// (`storage`, `key`) if present, and nothing otherwise.
    pub fn find(&self, storage: StorageId, key: &[u8]) -> Result<Cursor> {
        let target: EntryKey = (storage, key.to_vec());
        let mut cursor = self.make_cursor(Some((&target, true)))?;
        cursor.set_exact_match(target);
        Ok(cursor)
    }

    /// Cursor positioned at the first record with key `>=` (or `>` when
    /// `inclusive` is false) the given location.
    pub fn scan(&self, storage: StorageId, key: &[u8], inclusive: bool) -> Result<Cursor> {
        let target: EntryKey = (storage, key.to_vec());
        self.make_cursor(Some((&target, inclusive)))
    }

    /// Split the snapshot into up to `count` byte-balanced, disjoint
    /// ranges and return one cursor per range. The cursors are independent
    /// and may be consumed on separate threads.
    pub fn get_partitioned_cursors(&self, count: usize) -> Result<Vec<Cursor>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let splits = self.index.partition_splits(count);
        let mut cursors = Vec::with_capacity(splits.len() + 1);

        let mut start: Option<EntryKey> = None;
        for end in splits {
            let mut cursor = match &start {
                Some(key) => self.make_cursor(Some((key, true)))?,
                None => self.make_cursor(None)?,
            };
            cursor.set_upper_bound(end.clone());
            cursors.push(cursor);
            start = Some(end);
        }
        let last = match &start {
            Some(key) => self.make_cursor(Some((key, true)))?,
            None => self.make_cursor(None)?,
        };
        cursors.push(last);
        Ok(cursors)
    }

    fn make_cursor(&self, start: Option<(&EntryKey, bool)>) -> Result<Cursor> {
        let offset = match start {
            Some((key, _)) => self.index.seek_before(key),
            None => 0,
        };
        let snapshot_side = SideReader::open(&self.snapshot_path, offset)?;
        let compacted_side = match &self.compacted_path {
            Some(path) => Some(SideReader::open(path, 0)?),
            None => None,
        };

        let mut guards = vec![self.registry.acquire(&self.snapshot_path)];
        if let Some(path) = &self.compacted_path {
            guards.push(self.registry.acquire(path));
        }

        let mut cursor = Cursor::new(snapshot_side, compacted_side, guards);
        if let Some((key, inclusive)) = start {
            cursor.position(key, inclusive)?;
        }
        Ok(cursor)
    }
}
