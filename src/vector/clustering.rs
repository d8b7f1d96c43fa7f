//! K-means clustering over quantized vectors.
//!
//! This is the clusterer behind both the divide-and-conquer builder (splits
//! and per-dataset representatives) and the fixed-centroid cache rebuild.
//!
//! # Algorithm Details
//! - Distance metric: Cosine similarity (not Euclidean)
//! - Initialization: k distinct rows sampled uniformly without replacement
//! - Update: component-wise mean of the dequantized members, requantized
//! - Convergence: requantized centroids byte-identical to the previous pass
//! - Max iterations: 100
//!
//! # Performance Characteristics
//! - O(n * k * d * iterations) time complexity
//! - Assignment runs in chunks of [`BATCH_SIZE`] rows through the matrix
//!   cosine kernel, which fans out over rayon for large chunks

use crate::vector::quantize::QuantizedVector;
use crate::vector::similarity::{CosinePlan, Matrix};
use crate::vector::types::VectorError;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Maximum number of iterations for K-means clustering.
pub const MAX_ITERATIONS: usize = 100;

/// Rows per assignment chunk.
pub const BATCH_SIZE: usize = 1024;

/// Result of K-means clustering operation.
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansResult {
    /// Quantized cluster centroids.
    pub centroids: Vec<QuantizedVector>,

    /// Index into `centroids` for each input vector.
    pub assignments: Vec<usize>,

    /// Number of inputs assigned to each centroid.
    pub counts: Vec<usize>,

    /// Number of iterations run.
    pub iterations: usize,

    /// Whether the centroids stopped moving before the iteration ceiling.
    pub converged: bool,
}

/// Errors that can occur during clustering operations.
#[derive(Error, Debug)]
pub enum ClusteringError {
    #[error(
        "Empty vector set provided for clustering\nSuggestion: Ensure vectors are loaded before clustering"
    )]
    EmptyVectorSet,

    #[error("Invalid cluster count: {0}\nSuggestion: Use k of at least 1")]
    InvalidClusterCount(usize),

    #[error(
        "Dimension mismatch in vectors\nSuggestion: Ensure all vectors come from the same embedding model"
    )]
    DimensionMismatch,

    #[error("Vector operation error: {0}")]
    VectorError(#[from] VectorError),
}

/// Performs K-means clustering on quantized vectors using cosine similarity.
///
/// # Arguments
/// * `vectors` - Input vectors to cluster (non-empty, same dimension)
/// * `k` - Number of clusters (at least 1)
/// * `seed` - Optional RNG seed for reproducible initialization
///
/// # Returns
/// * `KMeansResult` with centroids, assignments and per-centroid counts
///
/// When `k >= vectors.len()` every distinct input becomes its own centroid
/// and no iterations run.
#[must_use = "clustering results should be used or the computation is wasted"]
pub fn kmeans_clustering(
    vectors: &[QuantizedVector],
    k: usize,
    seed: Option<u64>,
) -> Result<KMeansResult, ClusteringError> {
    if vectors.is_empty() {
        return Err(ClusteringError::EmptyVectorSet);
    }
    if k == 0 {
        return Err(ClusteringError::InvalidClusterCount(k));
    }
    let dimension = vectors[0].len();
    if vectors.iter().any(|v| v.len() != dimension) {
        return Err(ClusteringError::DimensionMismatch);
    }

    if k >= vectors.len() {
        return Ok(identity_clusters(vectors));
    }

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let mut centroids: Vec<QuantizedVector> = rand::seq::index::sample(&mut rng, vectors.len(), k)
        .into_iter()
        .map(|i| vectors[i].clone())
        .collect();

    let chunks = vectors
        .chunks(BATCH_SIZE)
        .map(Matrix::from_quantized)
        .collect::<Result<Vec<_>, _>>()?;
    let mut plan = CosinePlan::new();
    let mut assignments = Vec::with_capacity(vectors.len());
    let mut iterations = 0;
    let mut converged = false;

    while iterations < MAX_ITERATIONS {
        iterations += 1;

        assign(&chunks, &centroids, &mut plan, &mut assignments)?;
        let updated = update_centroids(&chunks, &assignments, &centroids)?;

        if updated == centroids {
            converged = true;
            break;
        }
        centroids = updated;
    }

    if !converged {
        // assignments still refer to the previous centroid set
        assign(&chunks, &centroids, &mut plan, &mut assignments)?;
        warn!("K-means did not fully converge after {MAX_ITERATIONS} iterations");
    }
    debug!(k, rows = vectors.len(), iterations, converged, "k-means finished");

    let mut counts = vec![0usize; centroids.len()];
    for &a in &assignments {
        counts[a] += 1;
    }

    Ok(KMeansResult {
        centroids,
        assignments,
        counts,
        iterations,
        converged,
    })
}

/// Every distinct input is its own centroid.
fn identity_clusters(vectors: &[QuantizedVector]) -> KMeansResult {
    let mut positions: HashMap<&QuantizedVector, usize> = HashMap::new();
    let mut centroids = Vec::new();
    let mut counts = Vec::new();
    let mut assignments = Vec::with_capacity(vectors.len());

    for vector in vectors {
        let slot = *positions.entry(vector).or_insert_with(|| {
            centroids.push(vector.clone());
            counts.push(0);
            centroids.len() - 1
        });
        counts[slot] += 1;
        assignments.push(slot);
    }

    KMeansResult {
        centroids,
        assignments,
        counts,
        iterations: 0,
        converged: true,
    }
}

/// Assigns every row to its most similar centroid.
fn assign(
    chunks: &[Matrix],
    centroids: &[QuantizedVector],
    plan: &mut CosinePlan,
    assignments: &mut Vec<usize>,
) -> Result<(), ClusteringError> {
    let centroid_matrix = Matrix::from_quantized(centroids)?;
    assignments.clear();
    for chunk in chunks {
        let result = plan.compute(chunk, &centroid_matrix)?;
        assignments.extend_from_slice(&result.nearest);
    }
    Ok(())
}

/// Recomputes each centroid as the mean of its members. Empty clusters keep
/// their previous centroid.
fn update_centroids(
    chunks: &[Matrix],
    assignments: &[usize],
    previous: &[QuantizedVector],
) -> Result<Vec<QuantizedVector>, ClusteringError> {
    let dimension = previous[0].len();
    let mut sums = vec![vec![0.0f64; dimension]; previous.len()];
    let mut sizes = vec![0usize; previous.len()];

    let rows = chunks.iter().flat_map(Matrix::iter_rows);
    for (row, &cluster) in rows.zip(assignments) {
        for (acc, &value) in sums[cluster].iter_mut().zip(row) {
            *acc += f64::from(value);
        }
        sizes[cluster] += 1;
    }

    sums.into_iter()
        .zip(sizes)
        .zip(previous)
        .map(|((sum, size), old)| {
            if size == 0 {
                return Ok(old.clone());
            }
            let mean: Vec<f32> = sum.iter().map(|s| (s / size as f64) as f32).collect();
            Ok(QuantizedVector::encode(&mean)?)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(values: &[f32]) -> QuantizedVector {
        QuantizedVector::encode(values).unwrap()
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            kmeans_clustering(&[], 2, None),
            Err(ClusteringError::EmptyVectorSet)
        ));
        assert!(matches!(
            kmeans_clustering(&[q(&[1.0, 0.0])], 0, None),
            Err(ClusteringError::InvalidClusterCount(0))
        ));
        assert!(matches!(
            kmeans_clustering(&[q(&[1.0, 0.0]), q(&[1.0, 0.0, 2.0])], 1, None),
            Err(ClusteringError::DimensionMismatch)
        ));
    }

    #[test]
    fn test_k_at_least_n_returns_inputs() {
        let data = vec![q(&[1.0, 0.0]), q(&[0.0, 1.0]), q(&[1.0, 0.0])];
        let result = kmeans_clustering(&data, 5, Some(1)).unwrap();

        assert_eq!(result.centroids, vec![data[0].clone(), data[1].clone()]);
        assert_eq!(result.assignments, vec![0, 1, 0]);
        assert_eq!(result.counts, vec![2, 1]);
        assert_eq!(result.iterations, 0);
    }

    #[test]
    fn test_single_cluster_is_quantized_mean() {
        let data = vec![q(&[1.0, 2.0, 3.0]), q(&[3.0, 2.0, 1.0]), q(&[2.0, 5.0, 2.0])];
        let result = kmeans_clustering(&data, 1, Some(7)).unwrap();

        let decoded: Vec<Vec<f32>> = data.iter().map(QuantizedVector::decode).collect();
        let mean: Vec<f32> = (0..3)
            .map(|d| (decoded.iter().map(|v| f64::from(v[d])).sum::<f64>() / 3.0) as f32)
            .collect();

        assert!(result.converged);
        assert_eq!(result.centroids, vec![q(&mean)]);
        assert_eq!(result.counts, vec![3]);
    }

    #[test]
    fn test_two_clusters_converge_to_group_means() {
        let group_a = [[1.0, 0.1], [0.9, 0.2], [1.0, 0.0]];
        let group_b = [[0.1, 1.0], [0.0, 0.9], [0.2, 1.0]];
        let data: Vec<QuantizedVector> = group_a.iter().chain(&group_b).map(|p| q(p)).collect();

        let result = kmeans_clustering(&data, 2, Some(42)).unwrap();
        assert!(result.converged);

        let a = result.assignments[0];
        let b = result.assignments[3];
        assert_ne!(a, b);
        assert!(result.assignments[..3].iter().all(|&x| x == a));
        assert!(result.assignments[3..].iter().all(|&x| x == b));
        assert_eq!(result.counts[a], 3);

        let expected_a = [2.9 / 3.0, 0.3 / 3.0];
        let expected_b = [0.3 / 3.0, 2.9 / 3.0];
        for (got, want) in result.centroids[a].decode().iter().zip(expected_a) {
            assert!((got - want).abs() < 0.01, "{got} vs {want}");
        }
        for (got, want) in result.centroids[b].decode().iter().zip(expected_b) {
            assert!((got - want).abs() < 0.01, "{got} vs {want}");
        }
    }

    #[test]
    fn test_seed_makes_runs_reproducible() {
        let data: Vec<QuantizedVector> = (0..200)
            .map(|i| q(&[(i as f32 * 0.13).sin(), (i as f32 * 0.29).cos(), i as f32 % 7.0]))
            .collect();

        let first = kmeans_clustering(&data, 4, Some(99)).unwrap();
        let second = kmeans_clustering(&data, 4, Some(99)).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.counts.iter().sum::<usize>(), data.len());
        assert!(first.iterations <= MAX_ITERATIONS);
    }
}
