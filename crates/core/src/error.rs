//! Error types for the Limestone engine.
//!
//! One unified error enum is used across all crates. We use `thiserror` for
//! the `Display` and `Error` implementations. Lower layers define small
//! format-specific error enums and convert into this type at the API
//! boundary, keeping file/offset context attached.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias for Limestone operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the Limestone engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying filesystem failure; fatal to the affected operation.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// File the operation was acting on.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A record was cut short. Recoverable during recovery (the file is
    /// truncated at the last good record boundary); fatal anywhere else.
    #[error("truncated record in {} at offset {offset}", path.display())]
    Truncated {
        /// File containing the torn record.
        path: PathBuf,
        /// Offset of the last complete record boundary.
        offset: u64,
    },

    /// An on-disk or in-memory invariant was violated, e.g. a decreasing
    /// epoch or overlapping sessions on one channel.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A cursor was requested before `ready()` completed.
    #[error("datastore is not ready")]
    NotReady,

    /// An explicit wait was interrupted by shutdown.
    #[error("operation cancelled")]
    Cancelled,

    /// An explicit wait ran past its deadline.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl Error {
    /// Wrap an `io::Error` with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Build an `InvariantViolation` from anything displayable.
    pub fn invariant(detail: impl Into<String>) -> Self {
        Error::InvariantViolation(detail.into())
    }

    /// True if this is a torn-record error that recovery may repair by
    /// truncating the file.
    pub fn is_truncation(&self) -> bool {
        matches!(self, Error::Truncated { .. })
    }

    /// True for the two outcomes an explicit wait can be interrupted with.
    pub fn is_wait_interruption(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }

    /// The file the error is attached to, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Error::Io { path, .. } | Error::Truncated { path, .. } => Some(path),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_display_includes_path() {
        let err = Error::io("/tmp/pwal_0000", io::Error::new(io::ErrorKind::NotFound, "gone"));
        let msg = err.to_string();
        assert!(msg.contains("/tmp/pwal_0000"));
        assert!(msg.contains("gone"));
    }

    #[test]
    fn test_truncated_classification() {
        let err = Error::Truncated {
            path: PathBuf::from("/tmp/pwal_0001"),
            offset: 128,
        };
        assert!(err.is_truncation());
        assert_eq!(err.path(), Some(Path::new("/tmp/pwal_0001")));
        assert!(err.to_string().contains("128"));
    }

    #[test]
    fn test_wait_interruption_classification() {
        assert!(Error::Cancelled.is_wait_interruption());
        assert!(Error::DeadlineExceeded.is_wait_interruption());
        assert!(!Error::NotReady.is_wait_interruption());
        assert!(!Error::invariant("x").is_wait_interruption());
    }

    #[test]
    fn test_invariant_display() {
        let err = Error::invariant("session already open on channel 2");
        assert!(err.to_string().contains("session already open"));
        assert_eq!(err.path(), None);
    }
}
