//! The online compactor.
//!
//! Runs while writers continue:
//!
//! 1. Rotate active PWALs; collect the frozen files and the durable epoch.
//! 2. Merge every non-migrated rotated PWAL with the previous compacted
//!    file into a new compacted file with a fresh id.
//! 3. Publish the result in the catalog: the new file joins
//!    `compacted_files`, the inputs join `migrated_pwals`, and
//!    `max_epoch_id` advances to the observed durable epoch.
//! 4. GC: drop superseded compacted files and migrated PWALs, skipping any
//!    file an open cursor still references. Deletion eligibility is checked
//!    under the catalog lock, and a file is removed from the catalog before
//!    it is removed from disk.
//!
//! A run with nothing rotated and nothing pending leaves the catalog
//! untouched, which is what makes back-to-back compactions idempotent.

use limestone_core::{EpochId, Error, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::compaction::{CatalogManager, CompactedFileRef};
use crate::epoch::EpochCoordinator;
use crate::paths;
use crate::snapshot::{CursorRegistry, SnapshotBuilder};
use crate::wal::{LogChannel, RotationManager};

/// Outcome of one compaction run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionStats {
    /// Files frozen by the rotation step.
    pub rotated_files: usize,
    /// PWAL inputs merged into the new compacted file.
    pub inputs_compacted: usize,
    /// Records in the new compacted file.
    pub entries_in_output: usize,
    /// Catalog `max_epoch_id` after the run.
    pub max_epoch_id: EpochId,
    /// The compacted file produced, if the run had anything to do.
    pub compacted_file: Option<PathBuf>,
    /// Files deleted by GC.
    pub deleted_files: usize,
    /// Deletions skipped because a cursor still references the file.
    pub deferred_deletions: usize,
}

/// Collapses rotated logs and the previous compacted file.
pub struct OnlineCompactor {
    data_location: PathBuf,
    catalog: Arc<Mutex<CatalogManager>>,
    registry: Arc<CursorRegistry>,
}

impl OnlineCompactor {
    /// Create a compactor over the given data location.
    pub fn new(
        data_location: PathBuf,
        catalog: Arc<Mutex<CatalogManager>>,
        registry: Arc<CursorRegistry>,
    ) -> Self {
        OnlineCompactor {
            data_location,
            catalog,
            registry,
        }
    }

    /// Run one compaction pass.
    pub fn run(
        &self,
        channels: &[Arc<LogChannel>],
        rotation: &RotationManager,
        coordinator: &EpochCoordinator,
    ) -> Result<CompactionStats> {
        let rotation_result = rotation.rotate_all(channels, coordinator)?;
        let durable_epoch = rotation_result.epoch_id();

        // Inputs: every rotated PWAL on disk not yet migrated. This picks
        // up files frozen by earlier standalone rotations as well.
        let (previous, new_id, inputs) = {
            let catalog = self.catalog.lock();
            let previous = catalog
                .catalog()
                .current_compacted()
                .map(|f| self.data_location.join(&f.name));
            let mut inputs = Vec::new();
            for path in paths::list_pwal_files(&self.data_location)
                .map_err(|e| Error::io(&self.data_location, e))?
            {
                let name = file_name_of(&path);
                if paths::is_active_pwal_file_name(&name) || catalog.catalog().is_migrated(&name)
                {
                    continue;
                }
                inputs.push(path);
            }
            (previous, catalog.catalog().next_file_id(), inputs)
        };

        let mut stats = CompactionStats {
            rotated_files: rotation_result.rotated_files().len(),
            inputs_compacted: inputs.len(),
            entries_in_output: 0,
            max_epoch_id: self.catalog.lock().catalog().max_epoch_id,
            compacted_file: None,
            deleted_files: 0,
            deferred_deletions: 0,
        };

        if inputs.is_empty() {
            debug!(
                target: "limestone::compaction",
                "nothing rotated and nothing pending; catalog unchanged"
            );
            self.collect_garbage(&mut stats)?;
            return Ok(stats);
        }

        let output = self
            .data_location
            .join(paths::compacted_file_name(new_id));
        let build = SnapshotBuilder::new().build(previous.as_deref(), &inputs, &output)?;
        stats.entries_in_output = build.entries_emitted;

        // Publish: the new compacted file subsumes its inputs up to the
        // durable epoch observed at rotation.
        {
            let mut catalog = self.catalog.lock();
            let state = catalog.catalog_mut();
            state.max_epoch_id = state.max_epoch_id.max(durable_epoch);
            state.compacted_files.insert(CompactedFileRef {
                name: file_name_of(&output),
                id: new_id,
            });
            for path in &inputs {
                state.migrated_pwals.insert(file_name_of(path));
            }
            let path = catalog.path().to_path_buf();
            catalog.save().map_err(|e| e.into_error(&path))?;
            stats.max_epoch_id = catalog.catalog().max_epoch_id;
        }
        stats.compacted_file = Some(output.clone());

        self.collect_garbage(&mut stats)?;

        info!(
            target: "limestone::compaction",
            inputs = stats.inputs_compacted,
            entries = stats.entries_in_output,
            max_epoch_id = stats.max_epoch_id,
            output = %output.display(),
            "compaction complete"
        );
        Ok(stats)
    }

    /// Delete superseded compacted files and migrated PWALs that no cursor
    /// references. Files still referenced stay listed and are retried on
    /// the next run.
    fn collect_garbage(&self, stats: &mut CompactionStats) -> Result<()> {
        let mut catalog = self.catalog.lock();
        let current_id = catalog
            .catalog()
            .current_compacted()
            .map(|f| f.id)
            .unwrap_or(0);

        let mut removable_refs = Vec::new();
        for file in &catalog.catalog().compacted_files {
            if file.id == current_id {
                continue;
            }
            let path = self.data_location.join(&file.name);
            if self.registry.is_referenced(&path) {
                stats.deferred_deletions += 1;
            } else {
                removable_refs.push(file.clone());
            }
        }

        let mut removable_pwals = Vec::new();
        for name in &catalog.catalog().migrated_pwals {
            let path = self.data_location.join(name);
            if !path.exists() {
                removable_pwals.push(name.clone());
            } else if self.registry.is_referenced(&path) {
                stats.deferred_deletions += 1;
            } else {
                removable_pwals.push(name.clone());
            }
        }

        if removable_refs.is_empty() && removable_pwals.is_empty() {
            return Ok(());
        }

        // Unlist before unlinking: the catalog never names a deleted file.
        {
            let state = catalog.catalog_mut();
            for file in &removable_refs {
                state.compacted_files.remove(file);
            }
            for name in &removable_pwals {
                state.migrated_pwals.remove(name);
            }
        }
        let path = catalog.path().to_path_buf();
        catalog.save().map_err(|e| e.into_error(&path))?;

        for file in removable_refs {
            let path = self.data_location.join(&file.name);
            match std::fs::remove_file(&path) {
                Ok(()) => stats.deleted_files += 1,
                Err(e) => warn!(
                    target: "limestone::compaction",
                    path = %path.display(),
                    error = %e,
                    "failed to delete superseded compacted file"
                ),
            }
        }
        for name in removable_pwals {
            let path = self.data_location.join(&name);
            match std::fs::remove_file(&path) {
                Ok(()) => stats.deleted_files += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    target: "limestone::compaction",
                    path = %path.display(),
                    error = %e,
                    "failed to delete migrated log file"
                ),
            }
        }
        Ok(())
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}
