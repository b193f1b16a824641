//! Log rotation.
//!
//! Rotation freezes every channel's active file by renaming it to a
//! timestamped immutable name and opening a fresh file in its place. The
//! rename runs under each channel's own serialization, and a channel with a
//! session in flight is waited out first, so rotation is safe to invoke
//! while writers keep going.

use chrono::Utc;
use limestone_core::{EpochId, Result};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::epoch::EpochCoordinator;
use crate::wal::LogChannel;

/// Outcome of one rotation pass: the durable epoch observed once every
/// channel had swapped files, and the set of files frozen by the pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationResult {
    epoch_id: EpochId,
    rotated_files: BTreeSet<PathBuf>,
}

impl RotationResult {
    /// Durable epoch at the end of the pass.
    pub fn epoch_id(&self) -> EpochId {
        self.epoch_id
    }

    /// Files frozen by this pass.
    pub fn rotated_files(&self) -> &BTreeSet<PathBuf> {
        &self.rotated_files
    }

    /// Consume the result, keeping only the rotated file set.
    pub fn into_rotated_files(self) -> BTreeSet<PathBuf> {
        self.rotated_files
    }
}

/// Rotates channels and names the frozen files.
///
/// The rotated name is `pwal_<ordinal>.<utc-timestamp>_<sequence>`; the
/// sequence number keeps names unique when rotations land within the
/// timestamp granularity.
pub struct RotationManager {
    sequence: AtomicU64,
}

impl RotationManager {
    /// Create a rotation manager.
    pub fn new() -> Self {
        RotationManager {
            sequence: AtomicU64::new(0),
        }
    }

    /// Rotate every channel, returning the frozen files and the durable
    /// epoch observed after the pass. Channels whose active file holds no
    /// entries are skipped.
    pub fn rotate_all(
        &self,
        channels: &[Arc<LogChannel>],
        coordinator: &EpochCoordinator,
    ) -> Result<RotationResult> {
        let mut rotated_files = BTreeSet::new();
        for channel in channels {
            let suffix = format!(
                "{}_{}",
                Utc::now().format("%Y%m%d%H%M%S%6f"),
                self.sequence.fetch_add(1, Ordering::Relaxed)
            );
            if let Some(path) = channel.rotate(&suffix)? {
                rotated_files.insert(path);
            }
        }

        let epoch_id = coordinator.durable_epoch();
        info!(
            target: "limestone::wal",
            rotated = rotated_files.len(),
            epoch_id,
            "rotation pass complete"
        );
        Ok(RotationResult {
            epoch_id,
            rotated_files,
        })
    }
}

impl Default for RotationManager {
    fn default() -> Self {
        Self::new()
    }
}
