//! Identifier types shared across the engine.

use std::fmt;

/// Identifies a logical table within the datastore.
pub type StorageId = u64;

/// Monotonically increasing label for a batch of write sessions.
pub type EpochId = u64;

/// Opaque identifier of an out-of-line (blob) value.
pub type BlobId = u64;

/// Version stamp attached to every mutation.
///
/// Write versions are compared lexicographically: the major component first
/// (by convention the epoch the write belongs to), then the minor component
/// (a caller-assigned sequence within the epoch). At identical
/// (storage, key), the greater write version wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WriteVersion {
    /// Major component, conventionally the owning epoch.
    pub major: EpochId,
    /// Minor component, ordering writes within one major value.
    pub minor: u64,
}

impl WriteVersion {
    /// Create a write version from its components.
    pub fn new(major: EpochId, minor: u64) -> Self {
        WriteVersion { major, minor }
    }
}

impl fmt::Display for WriteVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
