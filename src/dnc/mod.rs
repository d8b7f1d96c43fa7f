//! Divide-and-conquer bulk index construction.
//!
//! Rows are staged to compressed scratch files, recursively partitioned by
//! k-means on bounded samples, and emitted as leaves (centroid plus row
//! count) once a partition is small enough.

pub mod builder;
pub mod dataset;
pub mod sampling;

pub use builder::{BuildConfig, BuildError, BuildReport, DncBuilder, Leaf, prune_small_leaves};
pub use dataset::{DatasetError, DatasetWriter, DiskDataset};
pub use sampling::{RowStream, sample_rows, unique_indices};
