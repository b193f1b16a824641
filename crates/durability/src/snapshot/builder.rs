//! Snapshot construction.
//!
//! The builder runs at startup (over the previous compacted file plus every
//! non-migrated PWAL) and as the reader stage of compaction (over rotated
//! PWALs plus the previous compacted file). Both produce the same artifact:
//! a sorted entry file holding, per (storage, key), the record with the
//! maximum write version, plus one `ClearStorage` record per cleared
//! storage carrying the highest clear version seen.
//!
//! Tombstone winners are retained in the artifact so that it can be merged
//! against older compacted files without resurrecting deleted keys; the
//! cursor layer filters tombstones and clear-suppressed records out of the
//! observable snapshot. Winners at or below their storage's clear version
//! are permanently superseded and dropped here.
//!
//! # Per-file recovery
//!
//! PWAL inputs are replayed session by session:
//!
//! 1. `BeginSession` opens a session; entries accumulate against the most
//!    recently opened one.
//! 2. `EndSession` commits the entries of the session it closes.
//! 3. `InvalidatedSession` discards them.
//! 4. Sessions still open at end of file never committed (crash before
//!    `EndSession`) and are discarded.
//! 5. A torn tail truncates the file at the last good record boundary.
//!
//! Sorted inputs (compacted files) carry no session markers; every record
//! is committed by construction, and truncation there is fatal.

use limestone_core::{EpochId, Error, LogEntry, Result, StorageId, WriteVersion};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::format::{CodecError, EntryReader};
use crate::snapshot::file::{open_reader_at, SortedFileWriter};
use crate::snapshot::EntryKey;

/// Counters from one build pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BuildStats {
    /// Input files scanned (sorted inputs included).
    pub files_scanned: usize,
    /// Sessions whose entries were committed.
    pub sessions_committed: usize,
    /// Sessions discarded: invalidated, or never closed before end of file.
    pub sessions_discarded: usize,
    /// PWAL files truncated to repair a torn tail.
    pub files_truncated: usize,
    /// Records written to the output file (clear records included).
    pub entries_emitted: usize,
    /// Merge candidates superseded by a greater write version.
    pub entries_superseded: usize,
    /// Winners dropped because a clear-storage record covered them.
    pub entries_cleared: usize,
}

struct Candidate {
    entry: LogEntry,
    write_version: WriteVersion,
    input_rank: usize,
}

/// Merges log inputs into a sorted snapshot or compacted file.
pub struct SnapshotBuilder {
    repair_torn_tails: bool,
}

impl SnapshotBuilder {
    /// Create a builder that repairs torn PWAL tails in place, the
    /// recovery-time behavior.
    pub fn new() -> Self {
        SnapshotBuilder {
            repair_torn_tails: true,
        }
    }

    /// Control tail repair. Query-time rebuilds scan files writers may
    /// still be appending to; a partial tail there is in-flight data, not
    /// crash damage, and must be left alone.
    pub fn with_tail_repair(mut self, repair: bool) -> Self {
        self.repair_torn_tails = repair;
        self
    }

    /// Build a sorted artifact at `output` from an optional sorted input
    /// (the previous compacted file) plus PWAL inputs, publishing it
    /// atomically. PWAL inputs are repaired in place when their tail is
    /// torn; any other unreadable input aborts the build.
    ///
    /// Later inputs win write-version ties, so `pwal_inputs` should be
    /// ordered oldest first where that matters.
    pub fn build(
        &self,
        sorted_input: Option<&Path>,
        pwal_inputs: &[PathBuf],
        output: &Path,
    ) -> Result<BuildStats> {
        let mut stats = BuildStats::default();
        let mut winners: BTreeMap<EntryKey, Candidate> = BTreeMap::new();
        let mut clears: BTreeMap<StorageId, WriteVersion> = BTreeMap::new();

        if let Some(path) = sorted_input {
            self.scan_sorted_input(path, 0, &mut winners, &mut clears, &mut stats)?;
        }
        for (i, path) in pwal_inputs.iter().enumerate() {
            self.recover_pwal(path, i + 1, &mut winners, &mut clears, &mut stats)?;
        }

        // Apply the clear filter, then lay clears and winners out in one
        // ordered pass: a clear record sorts ahead of its storage's keys.
        let mut ordered: BTreeMap<(StorageId, Option<Vec<u8>>), LogEntry> = BTreeMap::new();
        for (storage, write_version) in &clears {
            ordered.insert(
                (*storage, None),
                LogEntry::ClearStorage {
                    storage: *storage,
                    write_version: *write_version,
                },
            );
        }
        for ((storage, key), candidate) in winners {
            if let Some(clear_version) = clears.get(&storage) {
                if candidate.write_version <= *clear_version {
                    stats.entries_cleared += 1;
                    continue;
                }
            }
            ordered.insert((storage, Some(key)), candidate.entry);
        }

        let mut writer = SortedFileWriter::create(output)?;
        for entry in ordered.values() {
            writer.write(entry)?;
        }
        stats.entries_emitted = writer.entries_written();
        writer.finish()?;

        info!(
            target: "limestone::snapshot",
            files = stats.files_scanned,
            committed = stats.sessions_committed,
            discarded = stats.sessions_discarded,
            emitted = stats.entries_emitted,
            "snapshot built"
        );
        Ok(stats)
    }

    /// Fold a sorted, marker-free input into the merge state.
    fn scan_sorted_input(
        &self,
        path: &Path,
        input_rank: usize,
        winners: &mut BTreeMap<EntryKey, Candidate>,
        clears: &mut BTreeMap<StorageId, WriteVersion>,
        stats: &mut BuildStats,
    ) -> Result<()> {
        let mut reader = open_reader_at(path, 0)?;
        stats.files_scanned += 1;
        loop {
            match reader.read_entry() {
                Ok(Some(entry)) => match entry {
                    LogEntry::ClearStorage {
                        storage,
                        write_version,
                    } => note_clear(clears, storage, write_version),
                    e if e.is_value_entry() => consider(winners, e, input_rank, stats),
                    LogEntry::AddStorage { .. } | LogEntry::RemoveStorage { .. } => {}
                    other => {
                        return Err(Error::invariant(format!(
                            "session marker {:?} in sorted file {}",
                            other,
                            path.display()
                        )))
                    }
                },
                Ok(None) => return Ok(()),
                // A published artifact must never be torn.
                Err(CodecError::Truncated { offset }) => {
                    return Err(Error::io(
                        path,
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("sorted file truncated at offset {}", offset),
                        ),
                    ));
                }
                Err(e) => return Err(e.into_error(path)),
            }
        }
    }

    /// Replay one PWAL: commit closed sessions, discard the rest, truncate
    /// a torn tail in place.
    fn recover_pwal(
        &self,
        path: &Path,
        input_rank: usize,
        winners: &mut BTreeMap<EntryKey, Candidate>,
        clears: &mut BTreeMap<StorageId, WriteVersion>,
        stats: &mut BuildStats,
    ) -> Result<()> {
        let file = std::fs::File::open(path).map_err(|e| Error::io(path, e))?;
        let mut reader = EntryReader::new(std::io::BufReader::new(file));
        stats.files_scanned += 1;

        // Sessions may nest only in the crash pattern: an unterminated
        // session followed by sessions appended after restart. `EndSession`
        // always closes the most recently opened one.
        let mut open_sessions: Vec<(EpochId, Vec<LogEntry>)> = Vec::new();

        loop {
            match reader.read_entry() {
                Ok(Some(LogEntry::BeginSession { epoch })) => {
                    open_sessions.push((epoch, Vec::new()));
                }
                Ok(Some(LogEntry::EndSession { epoch })) => {
                    let (begin_epoch, entries) = open_sessions.pop().ok_or_else(|| {
                        Error::invariant(format!(
                            "end-session without begin in {}",
                            path.display()
                        ))
                    })?;
                    if begin_epoch != epoch {
                        return Err(Error::invariant(format!(
                            "session began at epoch {} but ended at {} in {}",
                            begin_epoch,
                            epoch,
                            path.display()
                        )));
                    }
                    for entry in entries {
                        match entry {
                            LogEntry::ClearStorage {
                                storage,
                                write_version,
                            } => note_clear(clears, storage, write_version),
                            LogEntry::AddStorage { storage, .. }
                            | LogEntry::RemoveStorage { storage, .. } => {
                                debug!(
                                    target: "limestone::snapshot",
                                    storage,
                                    "storage lifecycle marker replayed (advisory)"
                                );
                            }
                            e => consider(winners, e, input_rank, stats),
                        }
                    }
                    stats.sessions_committed += 1;
                }
                Ok(Some(LogEntry::InvalidatedSession)) => {
                    if open_sessions.pop().is_none() {
                        return Err(Error::invariant(format!(
                            "invalidation without a session in {}",
                            path.display()
                        )));
                    }
                    stats.sessions_discarded += 1;
                }
                Ok(Some(LogEntry::DurableEpoch { .. })) => {
                    return Err(Error::invariant(format!(
                        "durable-epoch marker in log file {}",
                        path.display()
                    )));
                }
                Ok(Some(entry)) => match open_sessions.last_mut() {
                    Some((_, entries)) => entries.push(entry),
                    None => {
                        return Err(Error::invariant(format!(
                            "entry outside any session in {}",
                            path.display()
                        )))
                    }
                },
                Ok(None) => break,
                Err(CodecError::Truncated { offset }) => {
                    if self.repair_torn_tails {
                        warn!(
                            target: "limestone::snapshot",
                            path = %path.display(),
                            offset,
                            "truncating torn tail of log file"
                        );
                        let file = OpenOptions::new()
                            .write(true)
                            .open(path)
                            .map_err(|e| Error::io(path, e))?;
                        file.set_len(offset).map_err(|e| Error::io(path, e))?;
                        stats.files_truncated += 1;
                    } else {
                        debug!(
                            target: "limestone::snapshot",
                            path = %path.display(),
                            offset,
                            "partial tail left in place (file may be live)"
                        );
                    }
                    break;
                }
                Err(e) => return Err(e.into_error(path)),
            }
        }

        if !open_sessions.is_empty() {
            debug!(
                target: "limestone::snapshot",
                path = %path.display(),
                count = open_sessions.len(),
                "discarding sessions never closed"
            );
            stats.sessions_discarded += open_sessions.len();
        }
        Ok(())
    }
}

impl Default for SnapshotBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn note_clear(
    clears: &mut BTreeMap<StorageId, WriteVersion>,
    storage: StorageId,
    write_version: WriteVersion,
) {
    let slot = clears.entry(storage).or_insert(write_version);
    if write_version > *slot {
        *slot = write_version;
    }
}

fn consider(
    winners: &mut BTreeMap<EntryKey, Candidate>,
    entry: LogEntry,
    input_rank: usize,
    stats: &mut BuildStats,
) {
    let storage = entry.storage().expect("value entries carry a storage");
    let key = entry.key().expect("value entries carry a key").to_vec();
    let write_version = entry.write_version().expect("value entries carry a version");
    let candidate = Candidate {
        entry,
        write_version,
        input_rank,
    };

    match winners.entry((storage, key)) {
        std::collections::btree_map::Entry::Vacant(slot) => {
            slot.insert(candidate);
        }
        std::collections::btree_map::Entry::Occupied(mut slot) => {
            let held = slot.get();
            // Greater write version wins; at a tie the later input wins.
            let replaces = candidate.write_version > held.write_version
                || (candidate.write_version == held.write_version
                    && candidate.input_rank >= held.input_rank);
            if replaces {
                slot.insert(candidate);
            }
            stats.entries_superseded += 1;
        }
    }
}
