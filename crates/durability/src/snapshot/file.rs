//! Sorted entry files and their sampled index.
//!
//! Snapshots and compacted files share one format: entries sorted by
//! (storage, key) ascending, clear-storage records placed ahead of their
//! storage's keys, no session markers. Files are published with the
//! write-temp, fsync, rename sequence so readers only ever observe complete
//! artifacts.
//!
//! The index is a byte-sampled list of record offsets built once per
//! snapshot. It serves two purposes: seeking `find`/`scan` close to their
//! target, and computing byte-balanced partition splits.

use limestone_core::{Error, LogEntry, Result, StorageId};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::format::{write_entry, EntryReader};
use crate::paths;
use crate::snapshot::EntryKey;

/// Writes a sorted entry file and publishes it atomically.
pub struct SortedFileWriter {
    writer: BufWriter<File>,
    temp_path: PathBuf,
    final_path: PathBuf,
    entries_written: usize,
}

impl SortedFileWriter {
    /// Start writing; the data lands in a sibling temp file until
    /// [`SortedFileWriter::finish`] renames it into place.
    pub fn create(final_path: &Path) -> Result<Self> {
        if let Some(parent) = final_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let temp_path = final_path.with_extension("tmp");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| Error::io(&temp_path, e))?;
        Ok(SortedFileWriter {
            writer: BufWriter::new(file),
            temp_path,
            final_path: final_path.to_path_buf(),
            entries_written: 0,
        })
    }

    /// Append one entry. Callers are responsible for feeding entries in
    /// sorted order.
    pub fn write(&mut self, entry: &LogEntry) -> Result<()> {
        write_entry(&mut self.writer, entry).map_err(|e| Error::io(&self.temp_path, e))?;
        self.entries_written += 1;
        Ok(())
    }

    /// Entries written so far.
    pub fn entries_written(&self) -> usize {
        self.entries_written
    }

    /// Flush, fsync and atomically rename into the final path.
    pub fn finish(mut self) -> Result<PathBuf> {
        self.writer
            .flush()
            .map_err(|e| Error::io(&self.temp_path, e))?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| Error::io(&self.temp_path, e))?;
        std::fs::rename(&self.temp_path, &self.final_path)
            .map_err(|e| Error::io(&self.final_path, e))?;
        if let Some(parent) = self.final_path.parent() {
            paths::sync_dir(parent).map_err(|e| Error::io(parent, e))?;
        }
        debug!(
            target: "limestone::snapshot",
            path = %self.final_path.display(),
            entries = self.entries_written,
            "sorted file published"
        );
        Ok(self.final_path)
    }
}

/// Open a sorted file for streaming from the given record boundary.
pub(crate) fn open_reader_at(
    path: &Path,
    offset: u64,
) -> Result<EntryReader<BufReader<File>>> {
    let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| Error::io(path, e))?;
    Ok(EntryReader::with_offset(BufReader::new(file), offset))
}

/// One sampled record position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IndexSample {
    pub(crate) offset: u64,
    pub(crate) storage: StorageId,
    pub(crate) key: Vec<u8>,
}

/// Byte-sampled offsets into one sorted snapshot file.
#[derive(Debug, Clone)]
pub struct SnapshotIndex {
    samples: Vec<IndexSample>,
    total_bytes: u64,
}

impl SnapshotIndex {
    /// Build the index by scanning `path` once, taking one sample roughly
    /// every `sample_interval` bytes.
    pub fn build(path: &Path, sample_interval: u64) -> Result<Self> {
        let mut reader = open_reader_at(path, 0)?;
        let mut samples: Vec<IndexSample> = Vec::new();
        let mut last_sampled = 0u64;
        loop {
            let at = reader.offset();
            match reader.read_entry().map_err(|e| e.into_error(path))? {
                Some(entry) if entry.is_value_entry() => {
                    if samples.is_empty() || at.saturating_sub(last_sampled) >= sample_interval {
                        samples.push(IndexSample {
                            offset: at,
                            storage: entry.storage().unwrap_or_default(),
                            key: entry.key().unwrap_or_default().to_vec(),
                        });
                        last_sampled = at;
                    }
                }
                Some(_) => {}
                None => break,
            }
        }
        Ok(SnapshotIndex {
            samples,
            total_bytes: reader.offset(),
        })
    }

    /// Total payload bytes in the indexed file.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Number of samples held.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Greatest sampled offset whose key is `<= target`; `0` when the
    /// target precedes every sample.
    pub(crate) fn seek_before(&self, target: &EntryKey) -> u64 {
        let idx = self
            .samples
            .partition_point(|s| (s.storage, s.key.as_slice()) <= (target.0, target.1.as_slice()));
        if idx == 0 {
            0
        } else {
            self.samples[idx - 1].offset
        }
    }

    /// Keys at which to start partitions 1..n, byte-balanced. The result
    /// has at most `n - 1` strictly increasing split keys.
    pub(crate) fn partition_splits(&self, partitions: usize) -> Vec<EntryKey> {
        if partitions <= 1 || self.samples.is_empty() || self.total_bytes == 0 {
            return Vec::new();
        }
        let mut splits: Vec<EntryKey> = Vec::new();
        for k in 1..partitions {
            let target = self.total_bytes * k as u64 / partitions as u64;
            let idx = self.samples.partition_point(|s| s.offset < target);
            let Some(sample) = self.samples.get(idx) else {
                break;
            };
            let key = (sample.storage, sample.key.clone());
            if splits.last() != Some(&key) && sample.offset > 0 {
                splits.push(key);
            }
        }
        splits
    }
}
