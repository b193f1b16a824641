//! Compaction catalog persistence.
//!
//! The catalog records which compacted files exist, which PWALs their
//! content subsumes, and the epoch up to which that holds. It is a small
//! JSON document rewritten atomically (write temp, fsync, rename, sync the
//! directory), so readers only ever observe a complete catalog. An absent
//! file means a fresh installation and reads as the empty catalog.

use limestone_core::{EpochId, Error};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::paths;

/// Current catalog format version.
pub const CATALOG_FORMAT_VERSION: u32 = 1;

/// One compacted file: its file name and the id distinguishing it from
/// historical compacted files during GC.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompactedFileRef {
    /// File name under the data location.
    pub name: String,
    /// Monotonically assigned file id.
    pub id: u64,
}

/// Persistent compaction state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionCatalog {
    /// Catalog format version.
    pub version: u32,
    /// Epoch up to which the current compacted file subsumes PWAL content.
    pub max_epoch_id: EpochId,
    /// Every compacted file not yet garbage-collected.
    pub compacted_files: BTreeSet<CompactedFileRef>,
    /// PWAL file names whose content is fully covered by a compacted file.
    pub migrated_pwals: BTreeSet<String>,
}

impl Default for CompactionCatalog {
    fn default() -> Self {
        CompactionCatalog {
            version: CATALOG_FORMAT_VERSION,
            max_epoch_id: 0,
            compacted_files: BTreeSet::new(),
            migrated_pwals: BTreeSet::new(),
        }
    }
}

impl CompactionCatalog {
    /// The newest compacted file, by id.
    pub fn current_compacted(&self) -> Option<&CompactedFileRef> {
        self.compacted_files.iter().max_by_key(|f| f.id)
    }

    /// Id to assign the next compacted file.
    pub fn next_file_id(&self) -> u64 {
        self.compacted_files
            .iter()
            .map(|f| f.id)
            .max()
            .map_or(1, |id| id + 1)
    }

    /// True if the PWAL file name is already subsumed by compaction.
    pub fn is_migrated(&self, name: &str) -> bool {
        self.migrated_pwals.contains(name)
    }
}

/// Errors from catalog persistence.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The catalog file exists but does not parse.
    #[error("catalog does not parse: {0}")]
    Corrupt(#[from] serde_json::Error),

    /// The catalog was written by an unknown format version.
    #[error("unsupported catalog version {0}")]
    UnsupportedVersion(u32),
}

impl CatalogError {
    /// Attach the catalog path and convert into the engine error type.
    pub fn into_error(self, path: &Path) -> Error {
        match self {
            CatalogError::Io(source) => Error::io(path, source),
            other => Error::io(
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, other.to_string()),
            ),
        }
    }
}

/// Handles atomic catalog persistence.
pub struct CatalogManager {
    path: PathBuf,
    catalog: CompactionCatalog,
}

impl CatalogManager {
    /// Load the catalog under the metadata location; an absent file yields
    /// the empty catalog of a fresh installation.
    pub fn load(metadata_location: &Path) -> Result<Self, CatalogError> {
        let path = paths::catalog_file_path(metadata_location);
        let catalog = if path.exists() {
            let bytes = std::fs::read(&path)?;
            let catalog: CompactionCatalog = serde_json::from_slice(&bytes)?;
            if catalog.version != CATALOG_FORMAT_VERSION {
                return Err(CatalogError::UnsupportedVersion(catalog.version));
            }
            catalog
        } else {
            CompactionCatalog::default()
        };
        Ok(CatalogManager { path, catalog })
    }

    /// Path of the catalog file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read access to the in-memory catalog.
    pub fn catalog(&self) -> &CompactionCatalog {
        &self.catalog
    }

    /// Mutate access; callers must `save` to persist.
    pub fn catalog_mut(&mut self) -> &mut CompactionCatalog {
        &mut self.catalog
    }

    /// Persist the catalog atomically (write temp, fsync, rename).
    pub fn save(&self) -> Result<(), CatalogError> {
        let temp_path = self.path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(&self.catalog)?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&temp_path, &self.path)?;
        if let Some(dir) = self.path.parent() {
            paths::sync_dir(dir)?;
        }
        debug!(
            target: "limestone::compaction",
            path = %self.path.display(),
            max_epoch_id = self.catalog.max_epoch_id,
            "catalog saved"
        );
        Ok(())
    }
}
