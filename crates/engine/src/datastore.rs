//! The datastore facade.
//!
//! `Datastore` composes the durability layer into the public contract:
//!
//! - `create_channel` hands out single-writer log channels
//! - `ready` recovers on-disk state into a snapshot; it must complete
//!   before any cursor is issued
//! - `switch_epoch` / `wait_for_durable_epoch` drive the epoch coordinator
//! - `rotate_logs` / `compact_now` run rotation and online compaction
//! - `get_snapshot` returns a point-in-time snapshot handle, rebuilt when
//!   sessions have committed since the last build
//! - `shutdown` drains in two phases: refuse new sessions, wait for open
//!   ones, flush, release
//!
//! Writers are expected to begin sessions only after `ready()` has
//! recovered the files they append to.

use limestone_core::{EpochId, Error, Result};
use limestone_durability::compaction::{CatalogManager, OnlineCompactor};
use limestone_durability::snapshot::{BuildStats, CursorRegistry, Snapshot, SnapshotBuilder};
use limestone_durability::wal::{LogChannel, RotationManager, RotationResult};
use limestone_durability::{paths, BlobResolver, CompactionStats, EpochCoordinator};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::background::BackgroundCompactor;
use crate::config::DatastoreConfig;

/// The embeddable storage engine instance.
pub struct Datastore {
    config: DatastoreConfig,
    coordinator: Arc<EpochCoordinator>,
    channels: Arc<Mutex<Vec<Arc<LogChannel>>>>,
    catalog: Arc<Mutex<CatalogManager>>,
    registry: Arc<CursorRegistry>,
    rotation: Arc<RotationManager>,
    compactor: Arc<OnlineCompactor>,
    blob_resolver: BlobResolver,
    state: Mutex<DatastoreState>,
    background: Mutex<Option<BackgroundCompactor>>,
}

struct DatastoreState {
    ready: bool,
    shut_down: bool,
    snapshot: Option<CachedSnapshot>,
}

struct CachedSnapshot {
    handle: Arc<Snapshot>,
    sessions_at_build: u64,
}

impl Datastore {
    /// Open a datastore over the configured locations, creating them as
    /// needed and recovering the durable epoch.
    pub fn new(config: DatastoreConfig) -> Result<Self> {
        std::fs::create_dir_all(config.data_location())
            .map_err(|e| Error::io(config.data_location(), e))?;
        std::fs::create_dir_all(config.metadata_location())
            .map_err(|e| Error::io(config.metadata_location(), e))?;

        let coordinator = Arc::new(EpochCoordinator::open(config.metadata_location())?);
        let catalog_path = paths::catalog_file_path(config.metadata_location());
        let catalog = Arc::new(Mutex::new(
            CatalogManager::load(config.metadata_location())
                .map_err(|e| e.into_error(&catalog_path))?,
        ));
        let registry = Arc::new(CursorRegistry::new());
        let compactor = Arc::new(OnlineCompactor::new(
            config.data_location().to_path_buf(),
            Arc::clone(&catalog),
            Arc::clone(&registry),
        ));
        let blob_resolver = BlobResolver::new(config.data_location());

        info!(
            target: "limestone::engine",
            data_location = %config.data_location().display(),
            "datastore opened"
        );
        Ok(Datastore {
            config,
            coordinator,
            channels: Arc::new(Mutex::new(Vec::new())),
            catalog,
            registry,
            rotation: Arc::new(RotationManager::new()),
            compactor,
            blob_resolver,
            state: Mutex::new(DatastoreState {
                ready: false,
                shut_down: false,
                snapshot: None,
            }),
            background: Mutex::new(None),
        })
    }

    /// Create the next log channel. Channels may be created before
    /// `ready()`, but sessions must not begin until it completes.
    pub fn create_channel(&self) -> Result<Arc<LogChannel>> {
        if self.state.lock().shut_down {
            return Err(Error::invariant("datastore is shut down"));
        }
        let mut channels = self.channels.lock();
        let ordinal = channels.len() as u64;
        let channel = Arc::new(LogChannel::create(
            self.config.data_location(),
            ordinal,
            Arc::clone(&self.coordinator),
        )?);
        channels.push(Arc::clone(&channel));
        Ok(channel)
    }

    /// Recover all on-disk state into the snapshot. Must complete before
    /// any cursor is issued; calling it again is a no-op.
    pub fn ready(&self) -> Result<BuildStats> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(Error::invariant("datastore is shut down"));
        }
        if state.ready {
            return Ok(BuildStats::default());
        }

        let stats = self.build_snapshot(&mut state, true)?;
        state.ready = true;
        drop(state);

        if let Some(interval) = self.config.compaction_interval() {
            let compactor = Arc::clone(&self.compactor);
            let channels = Arc::clone(&self.channels);
            let rotation = Arc::clone(&self.rotation);
            let coordinator = Arc::clone(&self.coordinator);
            let worker = BackgroundCompactor::spawn(interval, move || {
                let channels = channels.lock().clone();
                if let Err(e) = compactor.run(&channels, &rotation, &coordinator) {
                    warn!(
                        target: "limestone::engine",
                        error = %e,
                        "scheduled compaction failed"
                    );
                }
            });
            *self.background.lock() = Some(worker);
        }

        info!(
            target: "limestone::engine",
            sessions = stats.sessions_committed,
            entries = stats.entries_emitted,
            "datastore ready"
        );
        Ok(stats)
    }

    /// Epoch new sessions are stamped with.
    pub fn current_epoch(&self) -> EpochId {
        self.coordinator.current_epoch()
    }

    /// Largest epoch known durable.
    pub fn durable_epoch(&self) -> EpochId {
        self.coordinator.durable_epoch()
    }

    /// Advance the epoch writers stamp on new sessions.
    pub fn switch_epoch(&self, epoch: EpochId) -> Result<()> {
        self.coordinator.switch_epoch(epoch)
    }

    /// Block until the durable epoch reaches `epoch`; see
    /// [`EpochCoordinator::wait_for_durable_epoch`].
    pub fn wait_for_durable_epoch(
        &self,
        epoch: EpochId,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.coordinator.wait_for_durable_epoch(epoch, timeout)
    }

    /// Freeze every channel's active file; returns the frozen set and the
    /// durable epoch observed after the pass.
    pub fn rotate_logs(&self) -> Result<RotationResult> {
        let channels = self.channels.lock().clone();
        self.rotation.rotate_all(&channels, &self.coordinator)
    }

    /// Run one compaction pass now, on the caller's thread.
    pub fn compact_now(&self) -> Result<CompactionStats> {
        let channels = self.channels.lock().clone();
        self.compactor
            .run(&channels, &self.rotation, &self.coordinator)
    }

    /// A point-in-time snapshot of the datastore. The snapshot is rebuilt
    /// first if sessions have committed since the last build.
    pub fn get_snapshot(&self) -> Result<Arc<Snapshot>> {
        let mut state = self.state.lock();
        if !state.ready {
            return Err(Error::NotReady);
        }

        let sessions = self.coordinator.sessions_completed();
        if let Some(cached) = &state.snapshot {
            if cached.sessions_at_build == sessions {
                return Ok(Arc::clone(&cached.handle));
            }
        }

        self.build_snapshot(&mut state, false)?;
        Ok(Arc::clone(
            &state.snapshot.as_ref().expect("snapshot just built").handle,
        ))
    }

    /// Resolver for out-of-line blob values.
    pub fn blob_resolver(&self) -> &BlobResolver {
        &self.blob_resolver
    }

    /// Two-phase drain: refuse new sessions, wait out open ones, flush
    /// every channel, stop background work and cancel epoch waiters.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.shut_down {
                return Ok(());
            }
            state.shut_down = true;
        }

        if let Some(mut worker) = self.background.lock().take() {
            worker.stop();
        }

        let channels = self.channels.lock().clone();
        for channel in channels {
            channel.close()?;
        }
        self.coordinator.shutdown();

        info!(target: "limestone::engine", "datastore shut down");
        Ok(())
    }

    /// Build the snapshot from the current compacted file plus every
    /// non-migrated PWAL. Tail repair only happens during recovery; live
    /// rebuilds leave files writers may still append to untouched.
    fn build_snapshot(
        &self,
        state: &mut DatastoreState,
        repair_torn_tails: bool,
    ) -> Result<BuildStats> {
        let sessions_at_build = self.coordinator.sessions_completed();

        let (sorted_input, pwal_inputs) = {
            let catalog = self.catalog.lock();
            let sorted_input = catalog
                .catalog()
                .current_compacted()
                .map(|f| self.config.data_location().join(&f.name));
            let mut pwal_inputs = Vec::new();
            for path in paths::list_pwal_files(self.config.data_location())
                .map_err(|e| Error::io(self.config.data_location(), e))?
            {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                if !catalog.catalog().is_migrated(&name) {
                    pwal_inputs.push(path);
                }
            }
            (sorted_input, pwal_inputs)
        };

        let output = paths::snapshot_file_path(self.config.data_location());
        let stats = SnapshotBuilder::new()
            .with_tail_repair(repair_torn_tails)
            .build(sorted_input.as_deref(), &pwal_inputs, &output)?;

        let snapshot = Snapshot::open(
            output,
            None,
            Arc::clone(&self.registry),
            self.config.index_sample_interval(),
        )?;
        state.snapshot = Some(CachedSnapshot {
            handle: Arc::new(snapshot),
            sessions_at_build,
        });
        Ok(stats)
    }
}

impl Drop for Datastore {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(
                target: "limestone::engine",
                error = %e,
                "shutdown during drop failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use limestone_core::{LogEntry, WriteVersion};

    fn entry(key: &[u8], value: &[u8], wv: (u64, u64)) -> LogEntry {
        LogEntry::Normal {
            storage: 1,
            key: key.to_vec(),
            value: value.to_vec(),
            write_version: WriteVersion::new(wv.0, wv.1),
        }
    }

    #[test]
    fn test_cursor_before_ready_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let datastore = Datastore::new(DatastoreConfig::for_testing(dir.path())).unwrap();
        assert!(matches!(
            datastore.get_snapshot(),
            Err(Error::NotReady)
        ));
    }

    #[test]
    fn test_write_then_read_through_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let datastore = Datastore::new(DatastoreConfig::for_testing(dir.path())).unwrap();
        datastore.ready().unwrap();
        let channel = datastore.create_channel().unwrap();

        datastore.switch_epoch(5).unwrap();
        channel.begin_session(5, None).unwrap();
        channel.add_entry(entry(b"a", b"x", (5, 0))).unwrap();
        channel.end_session().unwrap();

        let snapshot = datastore.get_snapshot().unwrap();
        let mut cursor = snapshot.get_cursor().unwrap();
        assert!(cursor.next().unwrap());
        let mut value = Vec::new();
        cursor.value(&mut value);
        assert_eq!(value, b"x");
        assert!(!cursor.next().unwrap());

        datastore.shutdown().unwrap();
    }

    #[test]
    fn test_snapshot_is_cached_until_new_sessions_commit() {
        let dir = tempfile::tempdir().unwrap();
        let datastore = Datastore::new(DatastoreConfig::for_testing(dir.path())).unwrap();
        datastore.ready().unwrap();
        let channel = datastore.create_channel().unwrap();

        let first = datastore.get_snapshot().unwrap();
        let again = datastore.get_snapshot().unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        datastore.switch_epoch(1).unwrap();
        channel.begin_session(1, None).unwrap();
        channel.add_entry(entry(b"a", b"x", (1, 0))).unwrap();
        channel.end_session().unwrap();

        let rebuilt = datastore.get_snapshot().unwrap();
        assert!(!Arc::ptr_eq(&first, &rebuilt));
    }

    #[test]
    fn test_shutdown_refuses_new_channels_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let datastore = Datastore::new(DatastoreConfig::for_testing(dir.path())).unwrap();
        datastore.ready().unwrap();
        datastore.shutdown().unwrap();
        datastore.shutdown().unwrap();
        assert!(datastore.create_channel().is_err());
    }

    #[test]
    fn test_ready_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let datastore = Datastore::new(DatastoreConfig::for_testing(dir.path())).unwrap();
        datastore.ready().unwrap();
        datastore.ready().unwrap();
    }
}
