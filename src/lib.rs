//! Limestone — an embeddable, append-only write-ahead log and snapshot
//! storage engine.
//!
//! Ordered key/value mutations are grouped into epochs over multiple
//! concurrent channels, persisted durably, and merged into a point-in-time
//! snapshot at recovery. Rotation, online compaction and partitioned
//! cursors run while writers continue.
//!
//! ```no_run
//! use limestone::{Datastore, DatastoreConfig, LogEntry, WriteVersion};
//!
//! # fn main() -> limestone::Result<()> {
//! let datastore = Datastore::new(DatastoreConfig::new("/var/lib/limestone"))?;
//! datastore.ready()?;
//! let channel = datastore.create_channel()?;
//!
//! datastore.switch_epoch(1)?;
//! channel.begin_session(1, None)?;
//! channel.add_entry(LogEntry::Normal {
//!     storage: 1,
//!     key: b"k".to_vec(),
//!     value: b"v".to_vec(),
//!     write_version: WriteVersion::new(1, 0),
//! })?;
//! channel.end_session()?;
//!
//! let snapshot = datastore.get_snapshot()?;
//! let mut cursor = snapshot.get_cursor()?;
//! while cursor.next()? {
//!     // consume records in (storage, key) order
//! }
//! datastore.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub use limestone_core::{
    BlobId, EpochId, Error, LogEntry, Result, StorageId, WriteVersion,
};
pub use limestone_durability::{
    BlobFile, BlobResolver, BuildStats, CompactionCatalog, CompactionStats, Cursor,
    EpochCoordinator, LogChannel, RotationResult, Snapshot,
};
pub use limestone_engine::{Datastore, DatastoreConfig};
