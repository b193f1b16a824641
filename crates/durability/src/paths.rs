//! On-disk layout helpers.
//!
//! Everything under the data location follows a fixed naming scheme:
//!
//! ```text
//! data_location/
//!   pwal_<ordinal>               active log file, one per channel
//!   pwal_<ordinal>.<timestamp>   rotated, immutable
//!   pwal_0000.compacted.<id>     compacted files
//!   epoch                        durable-epoch marker file
//!   compaction_catalog           compaction catalog
//!   data/snapshot                current snapshot
//!   blob/<aa>/<bb>/<id>          blob files
//! ```

use std::io;
use std::path::{Path, PathBuf};

/// Name of the durable-epoch marker file.
pub const EPOCH_FILE_NAME: &str = "epoch";

/// Name of the compaction catalog file.
pub const CATALOG_FILE_NAME: &str = "compaction_catalog";

/// Subdirectory holding the snapshot.
pub const SNAPSHOT_DIR_NAME: &str = "data";

/// File name of the snapshot inside [`SNAPSHOT_DIR_NAME`].
pub const SNAPSHOT_FILE_NAME: &str = "snapshot";

/// Subdirectory holding blob files.
pub const BLOB_DIR_NAME: &str = "blob";

/// Infix marking a compacted file, between the pwal prefix and the file id.
const COMPACTED_INFIX: &str = ".compacted.";

/// File name of a channel's active log file.
pub fn pwal_file_name(ordinal: u64) -> String {
    format!("pwal_{:04}", ordinal)
}

/// File name of a compacted file with the given id.
pub fn compacted_file_name(id: u64) -> String {
    format!("pwal_0000{}{}", COMPACTED_INFIX, id)
}

/// True if `name` is a PWAL file name, active or rotated (compacted files
/// are excluded).
pub fn is_pwal_file_name(name: &str) -> bool {
    name.starts_with("pwal_") && !name.contains(COMPACTED_INFIX)
}

/// True if `name` is an active PWAL (no rotation suffix).
pub fn is_active_pwal_file_name(name: &str) -> bool {
    is_pwal_file_name(name) && !name.contains('.')
}

/// Path of the durable-epoch file under the metadata location.
pub fn epoch_file_path(metadata_location: &Path) -> PathBuf {
    metadata_location.join(EPOCH_FILE_NAME)
}

/// Path of the compaction catalog under the metadata location.
pub fn catalog_file_path(metadata_location: &Path) -> PathBuf {
    metadata_location.join(CATALOG_FILE_NAME)
}

/// Path of the snapshot file under the data location.
pub fn snapshot_file_path(data_location: &Path) -> PathBuf {
    data_location.join(SNAPSHOT_DIR_NAME).join(SNAPSHOT_FILE_NAME)
}

/// List every PWAL file (active and rotated) under the data location,
/// sorted by file name for deterministic scan order.
pub fn list_pwal_files(data_location: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(data_location)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if is_pwal_file_name(&name) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Open a directory handle and fsync it, making a rename within it durable.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    let handle = std::fs::File::open(dir)?;
    handle.sync_all()
}
