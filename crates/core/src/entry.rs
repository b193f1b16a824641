//! The log entry model.
//!
//! Every record that reaches disk — mutations, storage lifecycle events and
//! session/epoch markers — is one `LogEntry` variant. The durability crate
//! owns the byte-level encoding; this type only models the logical content.

use crate::types::{BlobId, EpochId, StorageId, WriteVersion};

/// A single record in a log file, a snapshot or a compacted file.
///
/// Mutations (`Normal`, `RemoveEntry`, `NormalWithBlob`) carry a key and
/// participate in the per-key merge. `ClearStorage` removes every key of a
/// storage whose write version is not greater than the given one.
/// `AddStorage`/`RemoveStorage` are storage lifecycle markers. The four
/// marker variants bracket writer sessions and record durable epochs; they
/// never appear in sorted (snapshot/compacted) files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    /// Upsert of a key/value pair.
    Normal {
        /// Target storage.
        storage: StorageId,
        /// Entry key bytes.
        key: Vec<u8>,
        /// Entry value bytes.
        value: Vec<u8>,
        /// Version stamp of the write.
        write_version: WriteVersion,
    },

    /// Tombstone for a key.
    RemoveEntry {
        /// Target storage.
        storage: StorageId,
        /// Entry key bytes.
        key: Vec<u8>,
        /// Version stamp of the removal.
        write_version: WriteVersion,
    },

    /// Remove every key of `storage` with a write version `<=` the given one.
    ClearStorage {
        /// Target storage.
        storage: StorageId,
        /// Cut-off version.
        write_version: WriteVersion,
    },

    /// Storage created (advisory lifecycle marker).
    AddStorage {
        /// Target storage.
        storage: StorageId,
        /// Version stamp of the event.
        write_version: WriteVersion,
    },

    /// Storage dropped (advisory lifecycle marker).
    RemoveStorage {
        /// Target storage.
        storage: StorageId,
        /// Version stamp of the event.
        write_version: WriteVersion,
    },

    /// Upsert whose value lives out-of-line in blob files.
    NormalWithBlob {
        /// Target storage.
        storage: StorageId,
        /// Entry key bytes.
        key: Vec<u8>,
        /// Ids of the blob files holding the value.
        blob_ids: Vec<BlobId>,
        /// Version stamp of the write.
        write_version: WriteVersion,
    },

    /// A writer session opened at the given epoch.
    BeginSession {
        /// Epoch the session writes under.
        epoch: EpochId,
    },

    /// The session closed; all of its entries are about to be fsynced.
    EndSession {
        /// Epoch of the closing session.
        epoch: EpochId,
    },

    /// Durable-epoch watermark (epoch file only).
    DurableEpoch {
        /// The epoch that became durable.
        epoch: EpochId,
    },

    /// The preceding session's entries must be ignored on recovery.
    InvalidatedSession,
}

impl LogEntry {
    /// Storage the entry targets, if any.
    pub fn storage(&self) -> Option<StorageId> {
        match self {
            LogEntry::Normal { storage, .. }
            | LogEntry::RemoveEntry { storage, .. }
            | LogEntry::ClearStorage { storage, .. }
            | LogEntry::AddStorage { storage, .. }
            | LogEntry::RemoveStorage { storage, .. }
            | LogEntry::NormalWithBlob { storage, .. } => Some(*storage),
            _ => None,
        }
    }

    /// Key bytes, for the variants that carry a key.
    pub fn key(&self) -> Option<&[u8]> {
        match self {
            LogEntry::Normal { key, .. }
            | LogEntry::RemoveEntry { key, .. }
            | LogEntry::NormalWithBlob { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Write version, for the variants that carry one.
    pub fn write_version(&self) -> Option<WriteVersion> {
        match self {
            LogEntry::Normal { write_version, .. }
            | LogEntry::RemoveEntry { write_version, .. }
            | LogEntry::ClearStorage { write_version, .. }
            | LogEntry::AddStorage { write_version, .. }
            | LogEntry::RemoveStorage { write_version, .. }
            | LogEntry::NormalWithBlob { write_version, .. } => Some(*write_version),
            _ => None,
        }
    }

    /// True for session/epoch markers.
    pub fn is_marker(&self) -> bool {
        matches!(
            self,
            LogEntry::BeginSession { .. }
                | LogEntry::EndSession { .. }
                | LogEntry::DurableEpoch { .. }
                | LogEntry::InvalidatedSession
        )
    }

    /// True for the keyed variants that participate in the per-key merge.
    pub fn is_value_entry(&self) -> bool {
        matches!(
            self,
            LogEntry::Normal { .. }
                | LogEntry::RemoveEntry { .. }
                | LogEntry::NormalWithBlob { .. }
        )
    }
}
