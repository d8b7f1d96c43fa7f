//! Centroid-partitioned on-disk serving cache.
//!
//! The cache splits the corpus into one compressed record file per
//! centroid so a query only scans the files nearest to it. Small corpora
//! use a single flat file instead.

pub mod cache;
pub mod centroid_file;

pub use cache::{CacheLayout, CentroidInfo, CentroidScan, RefreshReport, SearchHit, ServingCache};
pub use centroid_file::{CentroidFile, CentroidReader, CentroidWriter, FILE_HEADER_LEN, Record};

use crate::source::SourceError;
use crate::vector::VectorError;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised by the serving cache.
#[derive(Error, Debug)]
pub enum ServingError {
    #[error("Cache file I/O failed for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "Cache file '{path}' is corrupted: {reason}\nSuggestion: Run a refresh to rebuild the serving cache"
    )]
    Corrupted { path: PathBuf, reason: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IVF trainer failed: {0}")]
    Trainer(String),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Vector(#[from] VectorError),
}

impl ServingError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn corrupted(path: &Path, source: io::Error) -> Self {
        Self::Corrupted {
            path: path.to_path_buf(),
            reason: source.to_string(),
        }
    }

    /// Whether a cache file is damaged and needs a rebuild.
    #[must_use]
    pub fn is_corrupted(&self) -> bool {
        matches!(self, Self::Corrupted { .. })
    }
}

/// Tuning for cache rebuilds and queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServingConfig {
    /// Target number of rows per centroid file.
    pub per_file_target: usize,

    /// Below `per_file_target * min_centroid_files` rows the cache is flat.
    pub min_centroid_files: usize,

    /// Step size of the streaming IVF update, in (0, 1].
    pub learning_rate: f32,

    /// Rows fetched from the source per page.
    pub page_size: usize,

    /// Pages in flight between the loader and the trainer thread.
    pub queue_size: usize,

    /// Centroid files scanned per query when the caller does not say.
    pub default_centroids: usize,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            per_file_target: 10_000,
            min_centroid_files: 2,
            learning_rate: 0.01,
            page_size: 1_000,
            queue_size: 4,
            default_centroids: 4,
        }
    }
}

impl ServingConfig {
    /// Number of centroid files for a corpus of `total` rows, or `None` when
    /// the corpus should be served flat.
    #[must_use]
    pub fn partitions(&self, total: u64) -> Option<usize> {
        let target = self.per_file_target.max(1) as u64;
        if total < target.saturating_mul(self.min_centroid_files as u64) {
            return None;
        }
        let desired = total.div_ceil(target).min(total);
        usize::try_from(desired).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partitions_threshold() {
        let config = ServingConfig {
            per_file_target: 100,
            min_centroid_files: 3,
            ..ServingConfig::default()
        };
        assert_eq!(config.partitions(0), None);
        assert_eq!(config.partitions(299), None);
        assert_eq!(config.partitions(300), Some(3));
        assert_eq!(config.partitions(301), Some(4));
    }
}
