//! Epoch coordination.
//!
//! The coordinator tracks two watermarks per datastore:
//!
//! - `current_epoch`: the epoch new sessions are stamped with. Advanced only
//!   by `switch_epoch`, which is caller-driven.
//! - `durable_epoch`: the largest epoch `e` such that every session written
//!   under an epoch `<= e` has either ended (and was fsynced by its channel)
//!   or cannot exist anymore because its epoch is closed for new sessions.
//!
//! Each channel reports its session lifecycle here. A channel that has never
//! begun a session is excluded from the computation. An active channel
//! contributes the highest epoch it can endorse: everything strictly below
//! its open session (plus its last completed epoch), or the full current
//! epoch while idle — sessions only ever open at the current epoch, so
//! nothing below it can gain new entries. The durable epoch is the minimum
//! contribution across active channels, clamped so it never decreases.
//!
//! When the durable epoch advances, a `DurableEpoch` marker is appended to
//! the `epoch` file and fsynced before waiters are woken. The fsync happens
//! under the coordinator lock so no waiter can observe an epoch that is not
//! yet on disk.

use limestone_core::{EpochId, Error, LogEntry, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::format::{write_entry, CodecError, EntryReader};
use crate::paths;

/// Per-datastore epoch state. One instance is shared by every channel and
/// by the datastore facade; pass it by `Arc`, never store it globally.
pub struct EpochCoordinator {
    state: Mutex<EpochState>,
    durable_changed: Condvar,
    path: PathBuf,
}

struct EpochState {
    current_epoch: EpochId,
    durable_epoch: EpochId,
    channels: HashMap<u64, ChannelEpochs>,
    /// Total sessions completed since open; lets readers detect new commits.
    sessions_completed: u64,
    epoch_file: File,
    shut_down: bool,
}

#[derive(Debug, Clone, Copy)]
struct ChannelEpochs {
    last_completed: EpochId,
    open_session: Option<EpochId>,
    /// False until the channel begins its first session; inactive channels
    /// do not participate in the durable-epoch computation.
    active: bool,
}

impl ChannelEpochs {
    /// Highest epoch this channel endorses as durable.
    fn contribution(&self, current_epoch: EpochId) -> EpochId {
        match self.open_session {
            Some(open) => self.last_completed.max(open.saturating_sub(1)),
            None => current_epoch,
        }
    }
}

impl EpochCoordinator {
    /// Open the coordinator, recovering the durable epoch from the `epoch`
    /// file. A torn tail is truncated at the last good record boundary.
    pub fn open(metadata_location: &Path) -> Result<Self> {
        let path = paths::epoch_file_path(metadata_location);
        let durable_epoch = Self::recover_epoch_file(&path)?;

        let epoch_file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| Error::io(&path, e))?;

        debug!(
            target: "limestone::epoch",
            durable_epoch,
            "epoch coordinator opened"
        );

        Ok(EpochCoordinator {
            state: Mutex::new(EpochState {
                current_epoch: durable_epoch,
                durable_epoch,
                channels: HashMap::new(),
                sessions_completed: 0,
                epoch_file,
                shut_down: false,
            }),
            durable_changed: Condvar::new(),
            path,
        })
    }

    /// Stream the epoch file and return the last recorded durable epoch.
    fn recover_epoch_file(path: &Path) -> Result<EpochId> {
        if !path.exists() {
            return Ok(0);
        }

        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let mut reader = EntryReader::new(BufReader::new(file));
        let mut durable = 0;
        loop {
            match reader.read_entry() {
                Ok(Some(LogEntry::DurableEpoch { epoch })) => {
                    if epoch < durable {
                        return Err(Error::invariant(format!(
                            "durable epoch regressed from {} to {} in {}",
                            durable,
                            epoch,
                            path.display()
                        )));
                    }
                    durable = epoch;
                }
                Ok(Some(other)) => {
                    return Err(Error::invariant(format!(
                        "unexpected record {:?} in epoch file {}",
                        other,
                        path.display()
                    )));
                }
                Ok(None) => break,
                Err(CodecError::Truncated { offset }) => {
                    warn!(
                        target: "limestone::epoch",
                        path = %path.display(),
                        offset,
                        "truncating torn tail of epoch file"
                    );
                    let file = OpenOptions::new()
                        .write(true)
                        .open(path)
                        .map_err(|e| Error::io(path, e))?;
                    file.set_len(offset).map_err(|e| Error::io(path, e))?;
                    break;
                }
                Err(e) => return Err(e.into_error(path)),
            }
        }
        Ok(durable)
    }

    /// Epoch new sessions are stamped with.
    pub fn current_epoch(&self) -> EpochId {
        self.state.lock().current_epoch
    }

    /// Largest epoch known durable across all channels.
    pub fn durable_epoch(&self) -> EpochId {
        self.state.lock().durable_epoch
    }

    /// Total sessions completed since the coordinator was opened.
    pub fn sessions_completed(&self) -> u64 {
        self.state.lock().sessions_completed
    }

    /// Advance the current epoch. `epoch` must be strictly greater than the
    /// current one.
    pub fn switch_epoch(&self, epoch: EpochId) -> Result<()> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(Error::invariant("epoch coordinator is shut down"));
        }
        if epoch <= state.current_epoch {
            return Err(Error::invariant(format!(
                "switch_epoch to {} does not advance current epoch {}",
                epoch, state.current_epoch
            )));
        }
        state.current_epoch = epoch;
        self.update_durable(&mut state)
    }

    /// Block until the durable epoch reaches `epoch`.
    ///
    /// With a timeout the wait fails with `DeadlineExceeded` once it
    /// elapses; shutdown interrupts any waiter with `Cancelled`.
    pub fn wait_for_durable_epoch(
        &self,
        epoch: EpochId,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if state.durable_epoch >= epoch {
                return Ok(());
            }
            if state.shut_down {
                return Err(Error::Cancelled);
            }
            match deadline {
                Some(d) => {
                    if self.durable_changed.wait_until(&mut state, d).timed_out() {
                        return if state.durable_epoch >= epoch {
                            Ok(())
                        } else {
                            Err(Error::DeadlineExceeded)
                        };
                    }
                }
                None => self.durable_changed.wait(&mut state),
            }
        }
    }

    /// Interrupt all waiters and refuse further epoch switches.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shut_down = true;
        self.durable_changed.notify_all();
    }

    /// A channel joined the datastore.
    pub(crate) fn register_channel(&self, ordinal: u64) {
        let mut state = self.state.lock();
        let durable = state.durable_epoch;
        state.channels.insert(
            ordinal,
            ChannelEpochs {
                last_completed: durable,
                open_session: None,
                active: false,
            },
        );
    }

    /// A channel opened a session. Sessions only open at the current epoch.
    pub(crate) fn session_begun(&self, ordinal: u64, epoch: EpochId) -> Result<()> {
        let mut state = self.state.lock();
        let current = state.current_epoch;
        let channel = state
            .channels
            .get_mut(&ordinal)
            .ok_or_else(|| Error::invariant(format!("channel {} is not registered", ordinal)))?;
        if channel.open_session.is_some() {
            return Err(Error::invariant(format!(
                "channel {} already has an open session",
                ordinal
            )));
        }
        if epoch != current {
            return Err(Error::invariant(format!(
                "session epoch {} does not match current epoch {}",
                epoch, current
            )));
        }
        channel.open_session = Some(epoch);
        channel.active = true;
        self.update_durable(&mut state)
    }

    /// A channel completed a session: its entries are fsynced on disk.
    pub(crate) fn session_ended(&self, ordinal: u64, epoch: EpochId) -> Result<()> {
        let mut state = self.state.lock();
        let channel = state
            .channels
            .get_mut(&ordinal)
            .ok_or_else(|| Error::invariant(format!("channel {} is not registered", ordinal)))?;
        if channel.open_session != Some(epoch) {
            return Err(Error::invariant(format!(
                "channel {} ended a session at epoch {} it never began",
                ordinal, epoch
            )));
        }
        channel.open_session = None;
        channel.last_completed = epoch;
        state.sessions_completed += 1;
        self.update_durable(&mut state)
    }

    /// A channel invalidated its open session; nothing became durable.
    pub(crate) fn session_invalidated(&self, ordinal: u64) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(channel) = state.channels.get_mut(&ordinal) {
            channel.open_session = None;
        }
        self.update_durable(&mut state)
    }

    /// Recompute the durable epoch; on advance, persist the marker and wake
    /// waiters. The epoch-file fsync runs under the state lock by design —
    /// waiters must never observe an epoch that is not on disk.
    fn update_durable(&self, state: &mut EpochState) -> Result<()> {
        let current = state.current_epoch;
        let candidate = match state
            .channels
            .values()
            .filter(|c| c.active)
            .map(|c| c.contribution(current))
            .min()
        {
            Some(candidate) => candidate,
            // No channel has written yet; nothing new can be endorsed.
            None => return Ok(()),
        };

        if candidate <= state.durable_epoch {
            return Ok(());
        }

        let mut buf = Vec::new();
        write_entry(&mut buf, &LogEntry::DurableEpoch { epoch: candidate })
            .map_err(|e| Error::io(&self.path, e))?;
        state
            .epoch_file
            .write_all(&buf)
            .map_err(|e| Error::io(&self.path, e))?;
        state
            .epoch_file
            .sync_all()
            .map_err(|e| Error::io(&self.path, e))?;

        debug!(
            target: "limestone::epoch",
            durable_epoch = candidate,
            "durable epoch advanced"
        );
        state.durable_epoch = candidate;
        self.durable_changed.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::read_all_entries;
    use std::sync::Arc;

    fn open(dir: &Path) -> EpochCoordinator {
        EpochCoordinator::open(dir).unwrap()
    }

    #[test]
    fn test_fresh_open_starts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let c = open(dir.path());
        assert_eq!(c.current_epoch(), 0);
        assert_eq!(c.durable_epoch(), 0);
    }

    #[test]
    fn test_switch_epoch_must_advance() {
        let dir = tempfile::tempdir().unwrap();
        let c = open(dir.path());
        c.switch_epoch(3).unwrap();
        assert_eq!(c.current_epoch(), 3);
        assert!(c.switch_epoch(3).is_err());
        assert!(c.switch_epoch(2).is_err());
    }

    #[test]
    fn test_session_must_use_current_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let c = open(dir.path());
        c.register_channel(0);
        c.switch_epoch(5).unwrap();
        assert!(c.session_begun(0, 4).is_err());
        c.session_begun(0, 5).unwrap();
        assert!(c.session_begun(0, 5).is_err(), "overlapping session");
    }

    #[test]
    fn test_durable_advances_after_session_end() {
        let dir = tempfile::tempdir().unwrap();
        let c = open(dir.path());
        c.register_channel(0);
        c.switch_epoch(7).unwrap();
        // No channel has written yet, so nothing is endorsed.
        assert_eq!(c.durable_epoch(), 0);

        c.session_begun(0, 7).unwrap();
        assert_eq!(c.durable_epoch(), 6, "open session holds back epoch 7");

        c.session_ended(0, 7).unwrap();
        assert_eq!(c.durable_epoch(), 7);
        assert_eq!(c.sessions_completed(), 1);
    }

    #[test]
    fn test_durable_waits_for_all_channels_of_the_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let c = open(dir.path());
        c.register_channel(0);
        c.register_channel(1);
        c.switch_epoch(4).unwrap();

        c.session_begun(0, 4).unwrap();
        c.session_begun(1, 4).unwrap();
        c.session_ended(0, 4).unwrap();
        assert_eq!(c.durable_epoch(), 3, "channel 1 still writing epoch 4");

        c.session_ended(1, 4).unwrap();
        assert_eq!(c.durable_epoch(), 4);
    }

    #[test]
    fn test_invalidated_session_releases_hold() {
        let dir = tempfile::tempdir().unwrap();
        let c = open(dir.path());
        c.register_channel(0);
        c.switch_epoch(2).unwrap();
        c.session_begun(0, 2).unwrap();
        assert_eq!(c.durable_epoch(), 1);
        c.session_invalidated(0).unwrap();
        assert_eq!(c.durable_epoch(), 2, "invalidated session no longer holds");
        c.switch_epoch(3).unwrap();
        assert_eq!(c.durable_epoch(), 3);
    }

    #[test]
    fn test_durable_epoch_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let c = open(dir.path());
            c.register_channel(0);
            c.switch_epoch(9).unwrap();
            c.session_begun(0, 9).unwrap();
            c.session_ended(0, 9).unwrap();
            assert_eq!(c.durable_epoch(), 9);
        }
        let c = open(dir.path());
        assert_eq!(c.durable_epoch(), 9);
        assert_eq!(c.current_epoch(), 9);
    }

    #[test]
    fn test_epoch_file_contains_only_durable_markers() {
        let dir = tempfile::tempdir().unwrap();
        let c = open(dir.path());
        c.register_channel(0);
        c.switch_epoch(2).unwrap();
        c.session_begun(0, 2).unwrap();
        c.session_ended(0, 2).unwrap();
        c.switch_epoch(5).unwrap();
        drop(c);

        let entries = read_all_entries(&paths::epoch_file_path(dir.path())).unwrap();
        assert!(!entries.is_empty());
        for e in &entries {
            assert!(matches!(e, LogEntry::DurableEpoch { .. }), "got {:?}", e);
        }
    }

    #[test]
    fn test_torn_epoch_file_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let c = open(dir.path());
            c.register_channel(0);
            c.switch_epoch(4).unwrap();
            c.session_begun(0, 4).unwrap();
            c.session_ended(0, 4).unwrap();
            assert_eq!(c.durable_epoch(), 4);
        }
        let path = paths::epoch_file_path(dir.path());
        // Append half a marker.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[crate::format::tag::DURABLE_EPOCH, 1, 2]).unwrap();
        drop(file);

        let c = open(dir.path());
        assert_eq!(c.durable_epoch(), 4);
        let entries = read_all_entries(&path).unwrap();
        assert!(entries
            .iter()
            .all(|e| matches!(e, LogEntry::DurableEpoch { .. })));
    }

    #[test]
    fn test_wait_returns_immediately_when_satisfied() {
        let dir = tempfile::tempdir().unwrap();
        let c = open(dir.path());
        c.register_channel(0);
        c.switch_epoch(3).unwrap();
        c.session_begun(0, 3).unwrap();
        c.session_ended(0, 3).unwrap();
        c.wait_for_durable_epoch(3, None).unwrap();
    }

    #[test]
    fn test_wait_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let c = open(dir.path());
        let err = c
            .wait_for_durable_epoch(10, Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
    }

    #[test]
    fn test_shutdown_cancels_waiters() {
        let dir = tempfile::tempdir().unwrap();
        let c = Arc::new(open(dir.path()));
        let waiter = {
            let c = Arc::clone(&c);
            std::thread::spawn(move || c.wait_for_durable_epoch(10, None))
        };
        std::thread::sleep(Duration::from_millis(20));
        c.shutdown();
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_waiter_wakes_on_session_end() {
        let dir = tempfile::tempdir().unwrap();
        let c = Arc::new(open(dir.path()));
        c.register_channel(0);
        c.switch_epoch(7).unwrap();
        c.session_begun(0, 7).unwrap();

        let waiter = {
            let c = Arc::clone(&c);
            std::thread::spawn(move || c.wait_for_durable_epoch(7, Some(Duration::from_secs(5))))
        };
        std::thread::sleep(Duration::from_millis(20));
        c.session_ended(0, 7).unwrap();
        waiter.join().unwrap().unwrap();
        assert_eq!(c.durable_epoch(), 7);
    }
}
