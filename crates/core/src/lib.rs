//! Core types for the Limestone storage engine
//!
//! This crate holds everything the on-disk layer and the datastore facade
//! share but that does not itself touch disk:
//!
//! - Identifier types: storage ids, epochs, blob ids, write versions
//! - The log entry model (`LogEntry`)
//! - The unified error type

pub mod entry;
pub mod error;
pub mod types;

pub use entry::LogEntry;
pub use error::{Error, Result};
pub use types::{BlobId, EpochId, StorageId, WriteVersion};
