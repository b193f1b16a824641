//! Datastore configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default spacing between snapshot index samples.
const DEFAULT_INDEX_SAMPLE_INTERVAL: u64 = 64 * 1024;

/// Configuration of one datastore instance.
///
/// `data_location` holds the log files, snapshot and blob tree;
/// `metadata_location` (the epoch file and compaction catalog) defaults to
/// the data location when not set.
#[derive(Debug, Clone)]
pub struct DatastoreConfig {
    data_location: PathBuf,
    metadata_location: Option<PathBuf>,
    index_sample_interval: u64,
    compaction_interval: Option<Duration>,
}

impl DatastoreConfig {
    /// Configuration rooted at `data_location` with defaults.
    pub fn new(data_location: impl Into<PathBuf>) -> Self {
        DatastoreConfig {
            data_location: data_location.into(),
            metadata_location: None,
            index_sample_interval: DEFAULT_INDEX_SAMPLE_INTERVAL,
            compaction_interval: None,
        }
    }

    /// Store the epoch file and compaction catalog elsewhere.
    pub fn with_metadata_location(mut self, location: impl Into<PathBuf>) -> Self {
        self.metadata_location = Some(location.into());
        self
    }

    /// Bytes between snapshot index samples; smaller means finer seeks and
    /// partition splits at the cost of a larger in-memory index.
    pub fn with_index_sample_interval(mut self, bytes: u64) -> Self {
        self.index_sample_interval = bytes.max(1);
        self
    }

    /// Run compaction on a schedule in addition to `compact_now`.
    pub fn with_compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = Some(interval);
        self
    }

    /// Small sample interval, no background compaction.
    pub fn for_testing(data_location: impl Into<PathBuf>) -> Self {
        Self::new(data_location).with_index_sample_interval(256)
    }

    /// Directory holding logs, snapshot and blobs.
    pub fn data_location(&self) -> &Path {
        &self.data_location
    }

    /// Directory holding the epoch file and catalog.
    pub fn metadata_location(&self) -> &Path {
        self.metadata_location
            .as_deref()
            .unwrap_or(&self.data_location)
    }

    /// Bytes between snapshot index samples.
    pub fn index_sample_interval(&self) -> u64 {
        self.index_sample_interval
    }

    /// Background compaction cadence, if any.
    pub fn compaction_interval(&self) -> Option<Duration> {
        self.compaction_interval
    }
}
