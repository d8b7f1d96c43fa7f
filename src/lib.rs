//! ivfstore: approximate nearest-neighbour storage for quantized vectors.
//!
//! Vectors are stored as 8-bit quantized rows, grouped under IVF centroids,
//! and served from compressed per-centroid files. Bulk rebuilds go through a
//! disk-backed divide-and-conquer builder; online rebuilds train the IVF
//! index while rows stream in.

pub mod config;
pub mod display;
pub mod dnc;
pub mod error;
pub mod logging;
pub mod metadata;
pub mod serving;
pub mod source;
pub mod storage;
pub mod vector;

// Explicit exports for better API clarity
pub use config::Settings;
pub use dnc::{BuildConfig, BuildReport, DncBuilder, Leaf};
pub use error::{Error, Result};
pub use metadata::{MetadataCache, TtlCache};
pub use serving::{CentroidScan, SearchHit, ServingCache, ServingConfig};
pub use source::{MemoryRowSource, Row, RowSource};
pub use storage::{CompressionService, default_compression};
pub use vector::{
    CentroidIndex, EmbeddingGenerator, IvfIndex, MockEmbeddingGenerator, QuantizedVector,
    VectorDimension, VectorId,
};
