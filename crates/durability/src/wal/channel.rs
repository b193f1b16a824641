//! Single-writer log channel.
//!
//! A channel appends length-prefixed entries to its `pwal_<ordinal>` file.
//! Writers bracket their work in sessions: `begin_session` emits a
//! `BeginSession` marker, `end_session` emits `EndSession`, flushes and
//! fsyncs. Entries of a session that was never ended are discarded at
//! recovery, which is what makes the session the unit of atomic visibility.
//!
//! The channel serializes all operations through one internal lock; cross
//! channel parallelism (including parallel fsync) is the expected mode of
//! operation. The file handle is owned here and never shared.

use limestone_core::{EpochId, Error, LogEntry, Result};
use parking_lot::{Condvar, Mutex};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::epoch::EpochCoordinator;
use crate::format::write_entry;
use crate::paths;

/// A single-writer append stream backed by one PWAL file.
pub struct LogChannel {
    ordinal: u64,
    path: PathBuf,
    coordinator: Arc<EpochCoordinator>,
    inner: Mutex<ChannelInner>,
    session_done: Condvar,
}

struct ChannelInner {
    file: File,
    session: Option<EpochId>,
    bytes_written: u64,
    closed: bool,
}

impl LogChannel {
    /// Open (or create) the channel's active file under `data_location` and
    /// register the channel with the epoch coordinator.
    pub fn create(
        data_location: &Path,
        ordinal: u64,
        coordinator: Arc<EpochCoordinator>,
    ) -> Result<Self> {
        let path = data_location.join(paths::pwal_file_name(ordinal));
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| Error::io(&path, e))?;
        let bytes_written = file
            .metadata()
            .map_err(|e| Error::io(&path, e))?
            .len();

        coordinator.register_channel(ordinal);
        debug!(
            target: "limestone::wal",
            channel = ordinal,
            path = %path.display(),
            "channel opened"
        );

        Ok(LogChannel {
            ordinal,
            path,
            coordinator,
            inner: Mutex::new(ChannelInner {
                file,
                session: None,
                bytes_written,
                closed: false,
            }),
            session_done: Condvar::new(),
        })
    }

    /// The channel's ordinal, encoded in its file name.
    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    /// Path of the active file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a session at `epoch`. Fails if a session is already open, the
    /// channel is closed, or `epoch` is not the coordinator's current epoch.
    ///
    /// `tx_id` is a caller-side transaction label used for diagnostics only;
    /// it is not encoded in the log.
    pub fn begin_session(&self, epoch: EpochId, tx_id: Option<u64>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::invariant(format!(
                "channel {} is closed",
                self.ordinal
            )));
        }
        if inner.session.is_some() {
            return Err(Error::invariant(format!(
                "channel {} already has an open session",
                self.ordinal
            )));
        }

        self.coordinator.session_begun(self.ordinal, epoch)?;
        if let Err(e) = self.write_record(&mut inner, &LogEntry::BeginSession { epoch }) {
            // The marker never reached the file; release the coordinator hold.
            let _ = self.coordinator.session_invalidated(self.ordinal);
            return Err(e);
        }
        inner.session = Some(epoch);

        trace!(
            target: "limestone::wal",
            channel = self.ordinal,
            epoch,
            tx_id = ?tx_id,
            "session begun"
        );
        Ok(())
    }

    /// Append one mutation to the open session.
    pub fn add_entry(&self, entry: LogEntry) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.session.is_none() {
            return Err(Error::invariant(format!(
                "channel {} has no open session",
                self.ordinal
            )));
        }
        if entry.is_marker() {
            return Err(Error::invariant(
                "session and epoch markers are written by the engine, not callers",
            ));
        }
        self.write_record(&mut inner, &entry)
    }

    /// Close the open session: emit `EndSession`, fsync, and publish the
    /// completed epoch to the coordinator. When this returns, every entry of
    /// the session is durable.
    pub fn end_session(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let epoch = inner.session.ok_or_else(|| {
            Error::invariant(format!("channel {} has no open session", self.ordinal))
        })?;

        self.write_record(&mut inner, &LogEntry::EndSession { epoch })?;
        inner
            .file
            .sync_all()
            .map_err(|e| Error::io(&self.path, e))?;
        inner.session = None;
        self.session_done.notify_all();

        // Publish only after the channel's own fsync: the coordinator treats
        // a completed session as on disk.
        self.coordinator.session_ended(self.ordinal, epoch)?;

        trace!(
            target: "limestone::wal",
            channel = self.ordinal,
            epoch,
            "session ended"
        );
        Ok(())
    }

    /// Mark the open session invalid: its entries are ignored at recovery.
    pub fn invalidate_session(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.session.is_none() {
            return Err(Error::invariant(format!(
                "channel {} has no open session",
                self.ordinal
            )));
        }

        self.write_record(&mut inner, &LogEntry::InvalidatedSession)?;
        inner
            .file
            .sync_all()
            .map_err(|e| Error::io(&self.path, e))?;
        inner.session = None;
        self.session_done.notify_all();
        self.coordinator.session_invalidated(self.ordinal)?;

        debug!(
            target: "limestone::wal",
            channel = self.ordinal,
            "session invalidated"
        );
        Ok(())
    }

    /// Freeze the active file: wait out an in-flight session, fsync, rename
    /// to `pwal_<ordinal>.<suffix>` and open a fresh file in its place.
    ///
    /// Returns `None` when the active file holds no entries.
    pub(crate) fn rotate(&self, suffix: &str) -> Result<Option<PathBuf>> {
        let mut inner = self.inner.lock();
        while inner.session.is_some() {
            self.session_done.wait(&mut inner);
        }
        if inner.bytes_written == 0 {
            return Ok(None);
        }

        inner
            .file
            .sync_all()
            .map_err(|e| Error::io(&self.path, e))?;

        let rotated_name = format!("{}.{}", paths::pwal_file_name(self.ordinal), suffix);
        let rotated_path = self.path.with_file_name(rotated_name);
        std::fs::rename(&self.path, &rotated_path).map_err(|e| Error::io(&self.path, e))?;

        let fresh = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&self.path)
            .map_err(|e| Error::io(&self.path, e))?;
        inner.file = fresh;
        inner.bytes_written = 0;

        if let Some(parent) = self.path.parent() {
            paths::sync_dir(parent).map_err(|e| Error::io(parent, e))?;
        }

        debug!(
            target: "limestone::wal",
            channel = self.ordinal,
            rotated = %rotated_path.display(),
            "log rotated"
        );
        Ok(Some(rotated_path))
    }

    /// Drain and close the channel: wait for an open session to finish,
    /// fsync, and refuse all further sessions.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        while inner.session.is_some() {
            self.session_done.wait(&mut inner);
        }
        if inner.closed {
            return Ok(());
        }
        inner
            .file
            .sync_all()
            .map_err(|e| Error::io(&self.path, e))?;
        inner.closed = true;
        debug!(target: "limestone::wal", channel = self.ordinal, "channel closed");
        Ok(())
    }

    fn write_record(&self, inner: &mut ChannelInner, entry: &LogEntry) -> Result<()> {
        use std::io::Write;

        let mut buf = Vec::new();
        write_entry(&mut buf, entry).map_err(|e| Error::io(&self.path, e))?;
        inner
            .file
            .write_all(&buf)
            .map_err(|e| Error::io(&self.path, e))?;
        inner.bytes_written += buf.len() as u64;
        Ok(())
    }
}
