//! Crate-level error taxonomy.
//!
//! Every module keeps its own `thiserror` enum with detailed variants. This
//! module folds them into the five kinds callers actually branch on.

use crate::dnc::{BuildError, DatasetError};
use crate::metadata::MetadataError;
use crate::serving::ServingError;
use crate::source::SourceError;
use crate::vector::{ClusteringError, VectorError};
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Empty, malformed or mismatched input.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation was cancelled by its caller.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error in {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A file is damaged beyond reading. The data has to be rebuilt.
    #[error("Corrupted file '{path}': {reason}")]
    Corrupted { path: PathBuf, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result alias using the crate error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    fn io(context: impl std::fmt::Display, source: std::io::Error) -> Self {
        Self::Io {
            context: context.to_string(),
            source,
        }
    }

    /// Stable identifier for logs and machine-readable output.
    pub fn status_code(&self) -> String {
        match self {
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Cancelled => "CANCELLED",
            Self::Io { .. } => "IO_ERROR",
            Self::Corrupted { .. } => "CORRUPTED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
        .to_string()
    }

    /// Get recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::InvalidArgument(_) => vec![
                "Check that every vector comes from the same embedding model",
                "Empty vectors and non-finite components are rejected",
            ],
            Self::Io { .. } => vec![
                "Check disk space and permissions for the cache and scratch directories",
            ],
            Self::Corrupted { .. } => vec![
                "Run 'ivfstore refresh' to rebuild the serving cache",
                "Check for disk errors or filesystem corruption",
            ],
            Self::Cancelled | Self::Internal(_) => vec![],
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    #[must_use]
    pub fn is_corrupted(&self) -> bool {
        matches!(self, Self::Corrupted { .. })
    }
}

impl From<VectorError> for Error {
    fn from(err: VectorError) -> Self {
        match err {
            VectorError::Storage(source) => Self::io("vector storage", source),
            VectorError::EmbeddingFailed(reason) => Self::Internal(reason),
            other => Self::InvalidArgument(other.to_string()),
        }
    }
}

impl From<ClusteringError> for Error {
    fn from(err: ClusteringError) -> Self {
        match err {
            ClusteringError::VectorError(inner) => inner.into(),
            other => Self::InvalidArgument(other.to_string()),
        }
    }
}

impl From<DatasetError> for Error {
    fn from(err: DatasetError) -> Self {
        match err {
            DatasetError::Io { path, source } => Self::io(path.display(), source),
            DatasetError::Corrupted { path, reason } => Self::Corrupted { path, reason },
            DatasetError::RowWidth { .. } => Self::InvalidArgument(err.to_string()),
            DatasetError::UnexpectedEnd => Self::Internal(err.to_string()),
            DatasetError::Clustering(inner) => inner.into(),
            DatasetError::Vector(inner) => inner.into(),
        }
    }
}

impl From<BuildError> for Error {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::Fatal(inner) | BuildError::Staging(inner) => inner.into(),
            BuildError::EmptyInput => Self::InvalidArgument(err.to_string()),
            BuildError::ScratchDir { path, source } => Self::io(path.display(), source),
            BuildError::ThreadPool(inner) => Self::Internal(inner.to_string()),
        }
    }
}

impl From<ServingError> for Error {
    fn from(err: ServingError) -> Self {
        match err {
            ServingError::Io { path, source } => Self::io(path.display(), source),
            ServingError::Corrupted { path, reason } => Self::Corrupted { path, reason },
            ServingError::InvalidArgument(reason) => Self::InvalidArgument(reason),
            ServingError::Trainer(reason) => Self::Internal(reason),
            ServingError::Source(inner) => inner.into(),
            ServingError::Vector(inner) => inner.into(),
        }
    }
}

impl From<SourceError> for Error {
    fn from(err: SourceError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<MetadataError> for Error {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound(_) => Self::InvalidArgument(err.to_string()),
            MetadataError::Loader(_) => Self::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_survives_conversion() {
        let err: Error = ServingError::Corrupted {
            path: PathBuf::from("centroid_3.cache"),
            reason: "failed to fill whole buffer".to_string(),
        }
        .into();
        assert!(err.is_corrupted());
        assert_eq!(err.status_code(), "CORRUPTED");
        assert!(!err.recovery_suggestions().is_empty());
    }

    #[test]
    fn test_vector_errors_map_to_invalid_argument() {
        let err: Error = ClusteringError::VectorError(VectorError::DimensionMismatch {
            expected: 4,
            actual: 3,
        })
        .into();
        assert_eq!(err.status_code(), "INVALID_ARGUMENT");

        let err: Error = DatasetError::Vector(VectorError::InvalidArgument("empty".into())).into();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_io_errors_keep_their_path() {
        let err: Error = BuildError::ScratchDir {
            path: PathBuf::from("/tmp/scratch"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        }
        .into();
        assert_eq!(err.status_code(), "IO_ERROR");
        assert!(err.to_string().contains("/tmp/scratch"));
    }

    #[test]
    fn test_cancelled_is_classified() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::Internal("x".into()).is_cancelled());
    }
}
