//! Cosine similarity kernels.
//!
//! Two entry points cover every caller in the crate:
//! - [`cosine_similarity`]: one query against every row of a matrix
//! - [`matrix_cosine_similarity`]: every row of A against every row of B,
//!   plus the per-row argmax
//!
//! The arithmetic lives behind [`NumericBackend`] so that an accelerated
//! implementation can be swapped in through a type parameter.
//! [`CosinePlan`] keeps normalized working buffers between calls of the
//! same shape.
//!
//! A zero-norm row always scores 0, never NaN.

use crate::vector::quantize::QuantizedVector;
use crate::vector::types::VectorError;
use rayon::prelude::*;

/// Grid size (rows_a * rows_b * cols) above which matrix kernels fan out
/// over the rayon pool.
const PARALLEL_THRESHOLD: usize = 1 << 16;

/// Dense row-major `f32` matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    data: Vec<f32>,
    rows: usize,
    cols: usize,
}

impl Matrix {
    /// Wraps a row-major buffer.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if `cols` is zero or the buffer length is not
    /// `rows * cols`.
    pub fn new(data: Vec<f32>, rows: usize, cols: usize) -> Result<Self, VectorError> {
        if cols == 0 {
            return Err(VectorError::InvalidArgument(
                "matrix must have at least one column".to_string(),
            ));
        }
        if data.len() != rows * cols {
            return Err(VectorError::InvalidArgument(format!(
                "matrix buffer holds {} values, expected {rows}x{cols}",
                data.len()
            )));
        }
        Ok(Self { data, rows, cols })
    }

    /// An empty matrix that rows of width `cols` can be pushed into.
    #[must_use]
    pub fn with_capacity(cols: usize, rows: usize) -> Self {
        Self {
            data: Vec::with_capacity(rows * cols),
            rows: 0,
            cols,
        }
    }

    /// Builds a matrix from float rows of equal length.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self, VectorError> {
        let cols = rows.first().map(Vec::len).ok_or_else(|| {
            VectorError::InvalidArgument("cannot build a matrix from zero rows".to_string())
        })?;
        let mut matrix = Self::with_capacity(cols, rows.len());
        for row in rows {
            matrix.push_row(row)?;
        }
        Ok(matrix)
    }

    /// Builds a matrix by dequantizing each row.
    pub fn from_quantized(rows: &[QuantizedVector]) -> Result<Self, VectorError> {
        let cols = rows.first().map(QuantizedVector::len).ok_or_else(|| {
            VectorError::InvalidArgument("cannot build a matrix from zero rows".to_string())
        })?;
        let mut matrix = Self::with_capacity(cols, rows.len());
        for row in rows {
            matrix.push_quantized(row)?;
        }
        Ok(matrix)
    }

    /// Appends one float row.
    pub fn push_row(&mut self, row: &[f32]) -> Result<(), VectorError> {
        self.check_width(row.len())?;
        self.data.extend_from_slice(row);
        self.rows += 1;
        Ok(())
    }

    /// Appends one quantized row, dequantizing in place.
    pub fn push_quantized(&mut self, row: &QuantizedVector) -> Result<(), VectorError> {
        self.check_width(row.len())?;
        row.decode_into(&mut self.data);
        self.rows += 1;
        Ok(())
    }

    /// Drops every row, keeping the allocation and column count.
    pub fn clear(&mut self) {
        self.data.clear();
        self.rows = 0;
    }

    fn check_width(&self, width: usize) -> Result<(), VectorError> {
        if width == 0 || width != self.cols {
            return Err(VectorError::DimensionMismatch {
                expected: self.cols,
                actual: width,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[must_use]
    pub fn row(&self, index: usize) -> &[f32] {
        &self.data[index * self.cols..(index + 1) * self.cols]
    }

    #[must_use]
    pub fn row_mut(&mut self, index: usize) -> &mut [f32] {
        &mut self.data[index * self.cols..(index + 1) * self.cols]
    }

    /// Iterates rows in order.
    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.cols)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// Result of an all-pairs cosine computation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MatrixSimilarity {
    /// Row-major `rows x cols` grid of scores.
    pub scores: Vec<f32>,
    /// Number of rows in A.
    pub rows: usize,
    /// Number of rows in B.
    pub cols: usize,
    /// For each row of A, the index of the most similar row of B.
    pub nearest: Vec<usize>,
}

impl MatrixSimilarity {
    /// Scores of row `i` of A against every row of B.
    #[must_use]
    pub fn row(&self, i: usize) -> &[f32] {
        &self.scores[i * self.cols..(i + 1) * self.cols]
    }

    #[must_use]
    pub fn score(&self, i: usize, j: usize) -> f32 {
        self.scores[i * self.cols + j]
    }
}

/// Numeric primitives the similarity kernels are built from.
///
/// Only `dot` and `normalize` are required. The provided kernels fan out over
/// rayon for large inputs; an accelerated backend may override them.
pub trait NumericBackend: Send + Sync {
    /// Dot product of two equal-length slices.
    fn dot(&self, a: &[f32], b: &[f32]) -> f32;

    /// Scales `row` to unit length in place. A zero row is left untouched.
    fn normalize(&self, row: &mut [f32]);

    /// Cosine of `vector` against every row of `matrix`, in row order.
    fn cosine_row(&self, vector: &[f32], matrix: &Matrix) -> Vec<f32> {
        let norm_v = self.dot(vector, vector).sqrt();
        matrix
            .iter_rows()
            .map(|row| {
                let norm_r = self.dot(row, row).sqrt();
                if norm_v == 0.0 || norm_r == 0.0 {
                    0.0
                } else {
                    self.dot(vector, row) / (norm_v * norm_r)
                }
            })
            .collect()
    }

    /// Dot products of every row of `a` against every row of `b`, written
    /// row-major into `out`. Callers normalize first to get cosines.
    fn dot_grid(&self, a: &Matrix, b: &Matrix, out: &mut [f32]) {
        let width = b.rows();
        if width == 0 {
            return;
        }
        let fill = |(i, scores): (usize, &mut [f32])| {
            let left = a.row(i);
            for (j, slot) in scores.iter_mut().enumerate() {
                *slot = self.dot(left, b.row(j));
            }
        };
        if a.rows() * b.rows() * a.cols() >= PARALLEL_THRESHOLD {
            out.par_chunks_mut(width).enumerate().for_each(fill);
        } else {
            out.chunks_mut(width).enumerate().for_each(fill);
        }
    }
}

/// Portable scalar backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalarBackend;

impl NumericBackend for ScalarBackend {
    fn dot(&self, a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len(), "Vectors must have same dimension");
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    fn normalize(&self, row: &mut [f32]) {
        let norm = self.dot(row, row).sqrt();
        if norm > 0.0 {
            for value in row.iter_mut() {
                *value /= norm;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlanShape {
    rows_a: usize,
    rows_b: usize,
    cols: usize,
}

/// Reusable working state for repeated matrix cosine calls.
///
/// Buffers are sized for one input shape. Calling [`CosinePlan::compute`]
/// with a different shape rebuilds them transparently. A plan is owned by
/// one pipeline; independent pipelines use independent plans.
#[derive(Debug)]
pub struct CosinePlan<B: NumericBackend = ScalarBackend> {
    backend: B,
    shape: Option<PlanShape>,
    left: Matrix,
    right: Matrix,
    output: MatrixSimilarity,
    rebuilds: usize,
}

impl Default for CosinePlan<ScalarBackend> {
    fn default() -> Self {
        Self::new()
    }
}

impl CosinePlan<ScalarBackend> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_backend(ScalarBackend)
    }
}

impl<B: NumericBackend> CosinePlan<B> {
    pub fn with_backend(backend: B) -> Self {
        Self {
            backend,
            shape: None,
            left: Matrix::with_capacity(1, 0),
            right: Matrix::with_capacity(1, 0),
            output: MatrixSimilarity::default(),
            rebuilds: 0,
        }
    }

    /// How many times the working buffers were (re)allocated.
    #[must_use]
    pub fn rebuilds(&self) -> usize {
        self.rebuilds
    }

    /// All-pairs cosine of `a` against `b`, with per-row argmax.
    ///
    /// # Errors
    /// `DimensionMismatch` if the column counts differ, `InvalidArgument` if
    /// `b` has no rows.
    pub fn compute(&mut self, a: &Matrix, b: &Matrix) -> Result<&MatrixSimilarity, VectorError> {
        if a.cols() != b.cols() {
            return Err(VectorError::DimensionMismatch {
                expected: b.cols(),
                actual: a.cols(),
            });
        }
        if b.rows() == 0 {
            return Err(VectorError::InvalidArgument(
                "cannot compare against an empty matrix".to_string(),
            ));
        }

        let shape = PlanShape {
            rows_a: a.rows(),
            rows_b: b.rows(),
            cols: a.cols(),
        };
        if self.shape != Some(shape) {
            self.rebuild(shape);
        }

        self.left.data.copy_from_slice(a.as_slice());
        self.right.data.copy_from_slice(b.as_slice());
        for i in 0..shape.rows_a {
            self.backend.normalize(self.left.row_mut(i));
        }
        for j in 0..shape.rows_b {
            self.backend.normalize(self.right.row_mut(j));
        }

        self.backend
            .dot_grid(&self.left, &self.right, &mut self.output.scores);
        for i in 0..shape.rows_a {
            let best = argmax(self.output.row(i));
            self.output.nearest[i] = best;
        }

        Ok(&self.output)
    }

    fn rebuild(&mut self, shape: PlanShape) {
        self.left = Matrix {
            data: vec![0.0; shape.rows_a * shape.cols],
            rows: shape.rows_a,
            cols: shape.cols,
        };
        self.right = Matrix {
            data: vec![0.0; shape.rows_b * shape.cols],
            rows: shape.rows_b,
            cols: shape.cols,
        };
        self.output = MatrixSimilarity {
            scores: vec![0.0; shape.rows_a * shape.rows_b],
            rows: shape.rows_a,
            cols: shape.rows_b,
            nearest: vec![0; shape.rows_a],
        };
        self.shape = Some(shape);
        self.rebuilds += 1;
    }
}

/// Cosine similarity of `vector` against every row of `matrix`.
///
/// # Returns
/// One score per matrix row, in row order.
pub fn cosine_similarity(vector: &[f32], matrix: &Matrix) -> Result<Vec<f32>, VectorError> {
    if vector.len() != matrix.cols() {
        return Err(VectorError::DimensionMismatch {
            expected: matrix.cols(),
            actual: vector.len(),
        });
    }
    Ok(ScalarBackend.cosine_row(vector, matrix))
}

/// All-pairs cosine similarity with a fresh plan.
///
/// Pipelines that call this repeatedly with one shape should hold a
/// [`CosinePlan`] instead.
pub fn matrix_cosine_similarity(a: &Matrix, b: &Matrix) -> Result<MatrixSimilarity, VectorError> {
    let mut plan = CosinePlan::new();
    plan.compute(a, b).cloned()
}

/// Cosine similarity of two vectors.
///
/// # Returns
/// Similarity in range [-1, 1]; 0 when either vector has zero norm.
#[must_use]
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let backend = ScalarBackend;
    let norm_a = backend.dot(a, a).sqrt();
    let norm_b = backend.dot(b, b).sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        backend.dot(a, b) / (norm_a * norm_b)
    }
}

/// Index of the largest score. Ties resolve to the lowest index.
#[must_use]
pub fn argmax(scores: &[f32]) -> usize {
    let mut best = 0;
    for (i, &score) in scores.iter().enumerate().skip(1) {
        if score > scores[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(rows: &[&[f32]]) -> Matrix {
        Matrix::from_rows(&rows.iter().map(|r| r.to_vec()).collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn test_self_similarity_is_one() {
        let v = [0.3, -0.7, 0.2, 0.9];
        let scores = cosine_similarity(&v, &matrix(&[&v])).unwrap();
        assert!((scores[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_is_symmetric() {
        let a = [1.0, 2.0, 3.0];
        let b = [-2.0, 0.5, 4.0];
        assert!((cosine(&a, &b) - cosine(&b, &a)).abs() < 1e-7);
    }

    #[test]
    fn test_zero_row_scores_zero() {
        let scores = cosine_similarity(&[1.0, 1.0], &matrix(&[&[0.0, 0.0], &[1.0, 1.0]])).unwrap();
        assert_eq!(scores[0], 0.0);
        assert!((scores[1] - 1.0).abs() < 1e-6);

        let grid = matrix_cosine_similarity(&matrix(&[&[0.0, 0.0]]), &matrix(&[&[1.0, 0.0]]))
            .unwrap();
        assert_eq!(grid.scores, vec![0.0]);
        assert!(!grid.scores[0].is_nan());
    }

    #[test]
    fn test_output_follows_row_order() {
        let m = matrix(&[&[1.0, 0.0], &[0.0, 1.0], &[-1.0, 0.0]]);
        let scores = cosine_similarity(&[1.0, 0.0], &m).unwrap();
        assert_eq!(scores.len(), 3);
        assert!((scores[0] - 1.0).abs() < 1e-6);
        assert!(scores[1].abs() < 1e-6);
        assert!((scores[2] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_matrix_argmax_prefers_lowest_index_on_tie() {
        let a = matrix(&[&[1.0, 0.0], &[0.0, 1.0]]);
        let b = matrix(&[&[0.0, 1.0], &[2.0, 0.0], &[1.0, 0.0], &[0.0, 3.0]]);
        let result = matrix_cosine_similarity(&a, &b).unwrap();

        assert_eq!(result.rows, 2);
        assert_eq!(result.cols, 4);
        assert_eq!(result.nearest, vec![1, 0]);
        assert!((result.score(0, 2) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let m = matrix(&[&[1.0, 0.0]]);
        assert!(matches!(
            cosine_similarity(&[1.0, 0.0, 0.0], &m),
            Err(VectorError::DimensionMismatch { .. })
        ));
        assert!(matrix_cosine_similarity(&matrix(&[&[1.0]]), &m).is_err());
        assert!(Matrix::from_rows(&[vec![1.0], vec![1.0, 2.0]]).is_err());
    }

    #[test]
    fn test_plan_reuses_buffers_for_same_shape() {
        let mut plan = CosinePlan::new();
        let a = matrix(&[&[1.0, 0.0]]);
        let b = matrix(&[&[1.0, 0.0], &[0.0, 1.0]]);

        plan.compute(&a, &b).unwrap();
        let second = plan.compute(&matrix(&[&[0.0, 2.0]]), &b).unwrap();
        assert_eq!(second.nearest, vec![1]);
        assert_eq!(plan.rebuilds(), 1);

        plan.compute(&matrix(&[&[1.0, 0.0], &[0.0, 1.0]]), &b).unwrap();
        assert_eq!(plan.rebuilds(), 2);
    }

    #[test]
    fn test_large_grid_matches_pairwise() {
        let rows: Vec<Vec<f32>> = (0..300)
            .map(|i| (0..32).map(|d| ((i * 31 + d * 7) % 17) as f32 - 8.0).collect())
            .collect();
        let a = Matrix::from_rows(&rows).unwrap();
        let result = matrix_cosine_similarity(&a, &a).unwrap();

        for i in [0, 57, 299] {
            for j in [0, 12, 250] {
                let expected = cosine(&rows[i], &rows[j]);
                assert!((result.score(i, j) - expected).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_matrix_from_quantized() {
        let q = vec![
            QuantizedVector::encode(&[-1.0, 0.0, 1.0]).unwrap(),
            QuantizedVector::encode(&[2.0, 2.0, 2.0]).unwrap(),
        ];
        let m = Matrix::from_quantized(&q).unwrap();
        assert_eq!(m.rows(), 2);
        assert_eq!(m.cols(), 3);
        assert_eq!(m.row(1), &[2.0, 2.0, 2.0]);
    }
}
