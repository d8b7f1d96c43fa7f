//! IVF coarse index with online mini-batch training.
//!
//! The index holds a fixed number of float centroids. Queries are routed to
//! the most similar centroids by cosine similarity. Training consumes
//! batches of quantized vectors and nudges every touched centroid toward the
//! mean of the batch members assigned to it:
//!
//! ```text
//! new = old - learning_rate * (old - batch_mean)
//! ```
//!
//! Training assigns by squared Euclidean distance on dequantized values,
//! not cosine. Centroid count never changes after construction.

use crate::vector::quantize::QuantizedVector;
use crate::vector::similarity::{Matrix, cosine_similarity};
use crate::vector::types::{CentroidIndex, VectorDimension, VectorError};
use crossbeam_channel::{Receiver, Sender};
use tracing::debug;

/// Counters reported when a streaming training session ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrainingStats {
    pub batches: u64,
    pub rows: u64,
}

/// Inverted-file coarse quantizer.
#[derive(Debug, Clone)]
pub struct IvfIndex {
    centroids: Matrix,
    learning_rate: f32,
    dimension: VectorDimension,
}

impl IvfIndex {
    /// Creates an index seeded with one centroid per input vector.
    ///
    /// # Errors
    /// `InvalidArgument` for empty seeds or a learning rate outside (0, 1];
    /// `DimensionMismatch` for seeds of mixed dimension.
    pub fn new(seeds: &[QuantizedVector], learning_rate: f32) -> Result<Self, VectorError> {
        if seeds.is_empty() {
            return Err(VectorError::InvalidArgument(
                "an IVF index needs at least one seed centroid".to_string(),
            ));
        }
        if !(learning_rate > 0.0 && learning_rate <= 1.0) {
            return Err(VectorError::InvalidArgument(format!(
                "learning rate must be in (0, 1], got {learning_rate}"
            )));
        }
        let centroids = Matrix::from_quantized(seeds)?;
        Ok(Self {
            dimension: VectorDimension::new(centroids.cols())?,
            centroids,
            learning_rate,
        })
    }

    /// Number of centroids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.centroids.rows()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.centroids.rows() == 0
    }

    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    #[must_use]
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Float centroids, one row per centroid.
    #[must_use]
    pub fn centroid_matrix(&self) -> &Matrix {
        &self.centroids
    }

    /// Quantized form of one centroid.
    pub fn centroid(&self, index: CentroidIndex) -> Result<QuantizedVector, VectorError> {
        if index.get() >= self.len() {
            return Err(VectorError::InvalidArgument(format!(
                "centroid {index} out of range for {} centroids",
                self.len()
            )));
        }
        QuantizedVector::encode(self.centroids.row(index.get()))
    }

    /// Quantized form of every centroid, in index order.
    pub fn centroids(&self) -> Result<Vec<QuantizedVector>, VectorError> {
        self.centroids
            .iter_rows()
            .map(QuantizedVector::encode)
            .collect()
    }

    /// Finds the `top_k` centroids most similar to `query`.
    ///
    /// # Returns
    /// `(centroid, similarity)` pairs sorted by descending similarity, ties in
    /// ascending centroid order. Asking for more centroids than exist
    /// returns all of them.
    pub fn nearest_centroids(
        &self,
        query: &QuantizedVector,
        top_k: usize,
    ) -> Result<Vec<(CentroidIndex, f32)>, VectorError> {
        self.nearest_centroids_raw(&query.decode(), top_k)
    }

    /// Same as [`IvfIndex::nearest_centroids`] for an unquantized query.
    pub fn nearest_centroids_raw(
        &self,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<(CentroidIndex, f32)>, VectorError> {
        self.dimension.validate_vector(query)?;
        let scores = cosine_similarity(query, &self.centroids)?;

        let mut ranked: Vec<(CentroidIndex, f32)> = scores
            .into_iter()
            .enumerate()
            .map(|(i, score)| (CentroidIndex::new(i), score))
            .collect();
        // stable sort keeps ascending index among equal scores
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.truncate(top_k);
        Ok(ranked)
    }

    /// Assigns one batch and applies the mini-batch update.
    ///
    /// # Returns
    /// The centroid index assigned to each batch row, in batch order.
    pub fn train_batch(&mut self, batch: &[QuantizedVector]) -> Result<Vec<usize>, VectorError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let rows = Matrix::from_quantized(batch)?;
        if rows.cols() != self.dimension.get() {
            return Err(VectorError::DimensionMismatch {
                expected: self.dimension.get(),
                actual: rows.cols(),
            });
        }

        let assignments: Vec<usize> = rows.iter_rows().map(|row| self.closest(row)).collect();

        let dim = self.dimension.get();
        let mut sums = vec![0.0f32; self.len() * dim];
        let mut counts = vec![0usize; self.len()];
        for (row, &c) in rows.iter_rows().zip(&assignments) {
            counts[c] += 1;
            for (acc, &v) in sums[c * dim..(c + 1) * dim].iter_mut().zip(row) {
                *acc += v;
            }
        }

        for (c, &count) in counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let mean = &sums[c * dim..(c + 1) * dim];
            for (old, &total) in self.centroids.row_mut(c).iter_mut().zip(mean) {
                let avg = total / count as f32;
                *old -= self.learning_rate * (*old - avg);
            }
        }

        Ok(assignments)
    }

    /// Consumes batches until the input channel disconnects, sending each
    /// batch's assignments downstream.
    ///
    /// Returns early without error if the assignment receiver goes away.
    pub fn train_streaming(
        &mut self,
        batches: Receiver<Vec<QuantizedVector>>,
        assignments: Sender<Vec<usize>>,
    ) -> Result<TrainingStats, VectorError> {
        let mut stats = TrainingStats::default();
        for batch in batches {
            let assigned = self.train_batch(&batch)?;
            stats.batches += 1;
            stats.rows += batch.len() as u64;
            if assignments.send(assigned).is_err() {
                debug!("assignment receiver dropped, stopping IVF training");
                break;
            }
        }
        debug!(
            batches = stats.batches,
            rows = stats.rows,
            "IVF streaming training finished"
        );
        Ok(stats)
    }

    /// Argmin of squared Euclidean distance. Ties resolve to the lowest index.
    fn closest(&self, row: &[f32]) -> usize {
        let mut best = 0;
        let mut best_distance = f32::INFINITY;
        for (i, centroid) in self.centroids.iter_rows().enumerate() {
            let distance: f32 = centroid
                .iter()
                .zip(row)
                .map(|(c, v)| (c - v) * (c - v))
                .sum();
            if distance < best_distance {
                best_distance = distance;
                best = i;
            }
        }
        best
    }
}
