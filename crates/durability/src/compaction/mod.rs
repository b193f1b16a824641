//! Online compaction.
//!
//! Compaction collapses rotated PWALs and the previous compacted file into
//! a fresh compacted file, publishes the result in the compaction catalog,
//! and garbage-collects files nothing references anymore.

mod catalog;
mod compactor;

pub use catalog::{
    CatalogError, CatalogManager, CompactedFileRef, CompactionCatalog, CATALOG_FORMAT_VERSION,
};
pub use compactor::{CompactionStats, OnlineCompactor};
