//! Durability layer for Limestone
//!
//! This crate handles everything that touches disk:
//!
//! - Log entry codec: length-prefixed, self-delimiting record streams
//! - Log channels: single-writer PWAL files with session brackets
//! - Epoch coordinator: the durable-epoch watermark and its on-disk marker file
//! - Rotation: atomic renames of active PWALs to timestamped immutable files
//! - Snapshot builder: session recovery and the per-key merge at startup
//! - Cursors: sorted iteration over a snapshot, optionally merged with the
//!   latest compacted file, with byte-balanced partitioning
//! - Compaction: catalog persistence, the online compactor and file GC
//! - Blob resolution: id-to-path mapping for out-of-line values

#![warn(missing_docs)]

pub mod blob;
pub mod compaction;
pub mod epoch;
pub mod format;
pub mod paths;
pub mod snapshot;
pub mod wal;

pub use blob::{BlobFile, BlobResolver};
pub use compaction::{
    CatalogManager, CompactedFileRef, CompactionCatalog, CompactionStats, OnlineCompactor,
};
pub use epoch::EpochCoordinator;
pub use format::{read_all_entries, write_entry, CodecError, EntryReader};
pub use snapshot::{
    BuildStats, Cursor, CursorRegistry, Snapshot, SnapshotBuilder, SnapshotIndex,
};
pub use wal::{LogChannel, RotationManager, RotationResult};
