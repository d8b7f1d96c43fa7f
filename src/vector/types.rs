//! Type-safe wrappers and core types for the vector engine.
//!
//! This module provides newtypes and the shared error type used by the
//! codec, the similarity kernels and the IVF index. Wrappers prevent
//! primitive obsession where ids, centroid slots and dimensions would
//! otherwise all be bare integers.

use thiserror::Error;

/// Identifier of a stored document vector.
///
/// Ids come from the row source and are opaque to the engine. Zero is a
/// valid id, so this wraps a plain `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VectorId(u64);

impl VectorId {
    /// Creates a new `VectorId`.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying u64 value.
    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Converts to little-endian bytes for storage.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    /// Creates from little-endian bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }
}

impl std::fmt::Display for VectorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a centroid inside an IVF index or serving cache.
///
/// Centroid slots are zero-based and dense: an index with `n` centroids
/// uses slots `0..n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CentroidIndex(usize);

impl CentroidIndex {
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn get(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for CentroidIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type-safe wrapper for vector dimensions.
///
/// Ensures runtime validation of vector dimensions to prevent
/// mismatches during similarity computations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorDimension(usize);

impl VectorDimension {
    /// Creates a new `VectorDimension` with validation.
    ///
    /// Returns an error if the dimension is zero.
    pub fn new(dim: usize) -> Result<Self, VectorError> {
        if dim == 0 {
            return Err(VectorError::InvalidDimension {
                dimension: 0,
                reason: "Vector dimension cannot be zero",
            });
        }
        Ok(Self(dim))
    }

    /// Creates a `VectorDimension` without validation.
    ///
    /// # Panics
    /// Panics if `dim` is zero. Use `new()` for fallible construction.
    #[must_use]
    pub fn new_unchecked(dim: usize) -> Self {
        assert!(dim > 0, "VectorDimension cannot be zero");
        Self(dim)
    }

    /// Returns the underlying dimension value.
    #[must_use]
    pub const fn get(&self) -> usize {
        self.0
    }

    /// Validates that a vector has the expected dimension.
    pub fn validate_vector(&self, vector: &[f32]) -> Result<(), VectorError> {
        if vector.len() != self.0 {
            return Err(VectorError::DimensionMismatch {
                expected: self.0,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

/// Errors that can occur during vector operations.
///
/// All error messages include actionable suggestions for resolution.
#[derive(Error, Debug)]
pub enum VectorError {
    #[error(
        "Vector dimension mismatch: expected {expected}, got {actual}\nSuggestion: Ensure all vectors use the same embedding model"
    )]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid vector dimension: {dimension}\nReason: {reason}")]
    InvalidDimension {
        dimension: usize,
        reason: &'static str,
    },

    #[error("Invalid argument: {0}\nSuggestion: Check the vectors passed to the engine")]
    InvalidArgument(String),

    #[error(
        "Malformed quantized vector: {0}\nSuggestion: Quantized vectors need an 8-byte header followed by at least one code"
    )]
    MalformedQuantized(String),

    #[error(
        "Embedding generation failed: {0}\nSuggestion: Verify the embedding provider is properly initialized"
    )]
    EmbeddingFailed(String),

    #[error("Storage error: {0}\nSuggestion: Check disk space and file permissions")]
    Storage(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_id_bytes() {
        let id = VectorId::new(0x0102_0304_0506_0708);
        let bytes = id.to_bytes();
        assert_eq!(bytes[0], 0x08);
        assert_eq!(VectorId::from_bytes(bytes), id);
        assert_eq!(VectorId::new(0).get(), 0);
    }

    #[test]
    fn test_vector_dimension_validation() {
        assert!(VectorDimension::new(0).is_err());

        let dim = VectorDimension::new(3).unwrap();
        assert_eq!(dim.get(), 3);
        assert!(dim.validate_vector(&[1.0, 2.0, 3.0]).is_ok());

        match dim.validate_vector(&[1.0]) {
            Err(VectorError::DimensionMismatch { expected, actual }) => {
                assert_eq!(expected, 3);
                assert_eq!(actual, 1);
            }
            other => panic!("expected dimension mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_error_messages_carry_suggestions() {
        let err = VectorError::InvalidArgument("empty vector".to_string());
        let message = err.to_string();
        assert!(message.contains("empty vector"));
        assert!(message.contains("Suggestion:"));
    }
}
