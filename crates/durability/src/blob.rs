//! Blob file resolution.
//!
//! Values stored out-of-line are addressed by 64-bit blob ids. Resolution
//! is a pure mapping from id to path with two levels of low-bit bucketing,
//! `blob/<aa>/<bb>/<id>`, keeping directory fan-out bounded. The engine
//! never opens blob files; readers resolve ids on demand.

use limestone_core::BlobId;
use std::path::{Path, PathBuf};

use crate::paths;

/// Maps blob ids to filesystem paths under the data location.
#[derive(Debug, Clone)]
pub struct BlobResolver {
    root: PathBuf,
}

impl BlobResolver {
    /// Create a resolver rooted at `data_location/blob`.
    pub fn new(data_location: &Path) -> Self {
        BlobResolver {
            root: data_location.join(paths::BLOB_DIR_NAME),
        }
    }

    /// Root directory of blob storage.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a blob id resolves to. Pure; the file may or may not exist.
    pub fn resolve(&self, id: BlobId) -> PathBuf {
        self.root
            .join(format!("{:02x}", id & 0xff))
            .join(format!("{:02x}", (id >> 8) & 0xff))
            .join(format!("{:016x}", id))
    }

    /// Resolve an id into a handle that records whether the file is
    /// present on disk.
    pub fn blob_file(&self, id: BlobId) -> BlobFile {
        let path = self.resolve(id);
        let available = path.is_file();
        BlobFile { path, available }
    }
}

/// A persistent blob file handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobFile {
    path: PathBuf,
    available: bool,
}

impl BlobFile {
    /// Path of the blob file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if the blob file was present when resolved.
    pub fn is_available(&self) -> bool {
        self.available
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucketing_uses_low_bits() {
        let resolver = BlobResolver::new(Path::new("/data"));
        assert_eq!(
            resolver.resolve(0x0102_0304),
            PathBuf::from("/data/blob/04/03/0000000001020304")
        );
    }

    #[test]
    fn test_resolution_is_stable() {
        let resolver = BlobResolver::new(Path::new("/data"));
        assert_eq!(resolver.resolve(42), resolver.resolve(42));
        assert_ne!(resolver.resolve(42), resolver.resolve(43));
    }

    #[test]
    fn test_blob_file_availability() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = BlobResolver::new(dir.path());

        let missing = resolver.blob_file(7);
        assert!(!missing.is_available());

        let path = resolver.resolve(7);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"payload").unwrap();
        let present = resolver.blob_file(7);
        assert!(present.is_available());
        assert_eq!(present.path(), path.as_path());
    }
}
