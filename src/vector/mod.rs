//! Vector engine: quantization, similarity, clustering and the IVF index.
//!
//! # Architecture
//! Document vectors are stored as 8-bit quantized rows with a per-vector
//! scale. The IVF coarse index routes queries to a handful of centroids so a
//! search only scans the rows filed under them. Centroids come either from
//! online mini-batch training or from the divide-and-conquer builder in
//! [`crate::dnc`].

mod clustering;
mod embedding;
mod ivf;
mod quantize;
mod similarity;
mod types;

// Re-export core types for public API
pub use clustering::{BATCH_SIZE, ClusteringError, KMeansResult, MAX_ITERATIONS, kmeans_clustering};
pub use embedding::{EmbeddingGenerator, MockEmbeddingGenerator};
pub use ivf::{IvfIndex, TrainingStats};
pub use quantize::{
    HEADER_LEN, MIDPOINT_CODE, QuantizedVector, decode_matrix, encode_matrix, encoded_len,
};
pub use similarity::{
    CosinePlan, Matrix, MatrixSimilarity, NumericBackend, ScalarBackend, argmax, cosine,
    cosine_similarity, matrix_cosine_similarity,
};
pub use types::{CentroidIndex, VectorDimension, VectorError, VectorId};
