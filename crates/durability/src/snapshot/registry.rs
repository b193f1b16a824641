//! Cursor registry.
//!
//! Every open cursor (and every live snapshot handle) holds a guard on the
//! files it reads. Compaction GC consults the registry before deleting a
//! file; a referenced file survives until its last reader drops.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Reference counts of files opened by cursors, keyed by path.
#[derive(Debug, Default)]
pub struct CursorRegistry {
    counts: Mutex<HashMap<PathBuf, usize>>,
}

impl CursorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        CursorRegistry::default()
    }

    /// Register a reader of `path`; the returned guard keeps the file
    /// protected from GC until dropped.
    pub fn acquire(self: &Arc<Self>, path: &Path) -> RegistryGuard {
        let mut counts = self.counts.lock();
        *counts.entry(path.to_path_buf()).or_insert(0) += 1;
        RegistryGuard {
            registry: Arc::clone(self),
            path: path.to_path_buf(),
        }
    }

    /// True while any reader holds a guard on `path`.
    pub fn is_referenced(&self, path: &Path) -> bool {
        self.counts.lock().get(path).copied().unwrap_or(0) > 0
    }

    fn release(&self, path: &Path) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(path) {
            *count -= 1;
            if *count == 0 {
                counts.remove(path);
            }
        }
    }
}

/// RAII registration of one reader on one file.
#[derive(Debug)]
pub struct RegistryGuard {
    registry: Arc<CursorRegistry>,
    path: PathBuf,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.release(&self.path);
    }
}
