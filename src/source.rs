//! Row source boundary.
//!
//! The durable store that owns documents and their vectors lives outside
//! this crate. Rebuilds only need three things from it: a row count, a
//! random sample of rows, and stable paging over every row.

use crate::vector::{QuantizedVector, VectorError, VectorId};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use thiserror::Error;

/// One stored document vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub id: VectorId,
    pub vector: QuantizedVector,
}

impl Row {
    #[must_use]
    pub fn new(id: u64, vector: QuantizedVector) -> Self {
        Self {
            id: VectorId::new(id),
            vector,
        }
    }
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Row source unavailable: {0}\nSuggestion: Check the connection to the backing store")]
    Unavailable(String),
}

/// Read access to the durable vector store.
///
/// Implementations must be thread-safe; rebuilds read pages from a
/// background thread while queries continue elsewhere.
pub trait RowSource: Send + Sync {
    /// Total number of rows.
    fn count(&self) -> Result<u64, SourceError>;

    /// Up to `n` distinct rows chosen uniformly at random.
    fn random_rows(&self, n: usize) -> Result<Vec<Row>, SourceError>;

    /// Rows `offset..offset + limit` in a stable order. Returns fewer than
    /// `limit` rows only at the end.
    fn page(&self, offset: u64, limit: usize) -> Result<Vec<Row>, SourceError>;
}

/// In-memory row store.
#[derive(Debug, Default)]
pub struct MemoryRowSource {
    rows: RwLock<Vec<Row>>,
}

impl MemoryRowSource {
    #[must_use]
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: RwLock::new(rows),
        }
    }

    /// Deterministic corpus of `rows` vectors scattered around `clusters`
    /// random directions. Row ids are `0..rows`.
    pub fn synthetic(
        rows: u64,
        dimension: usize,
        clusters: usize,
        seed: u64,
    ) -> Result<Self, VectorError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let clusters = clusters.max(1);
        let centers: Vec<Vec<f32>> = (0..clusters)
            .map(|_| (0..dimension).map(|_| rng.random_range(-1.0f32..1.0)).collect())
            .collect();

        let rows = (0..rows)
            .map(|id| {
                let center = &centers[(id % clusters as u64) as usize];
                let noisy: Vec<f32> = center
                    .iter()
                    .map(|&c| c + rng.random_range(-0.15f32..0.15))
                    .collect();
                QuantizedVector::encode(&noisy).map(|vector| Row::new(id, vector))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(rows))
    }

    /// Appends a row.
    pub fn insert(&self, row: Row) {
        self.rows.write().push(row);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Copy of every stored vector, in insertion order.
    #[must_use]
    pub fn vectors(&self) -> Vec<QuantizedVector> {
        self.rows.read().iter().map(|r| r.vector.clone()).collect()
    }
}

impl RowSource for MemoryRowSource {
    fn count(&self) -> Result<u64, SourceError> {
        Ok(self.rows.read().len() as u64)
    }

    fn random_rows(&self, n: usize) -> Result<Vec<Row>, SourceError> {
        let rows = self.rows.read();
        Ok(rows.choose_multiple(&mut rand::rng(), n).cloned().collect())
    }

    fn page(&self, offset: u64, limit: usize) -> Result<Vec<Row>, SourceError> {
        let rows = self.rows.read();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(rows.len());
        let end = start.saturating_add(limit).min(rows.len());
        Ok(rows[start..end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(n: u64) -> MemoryRowSource {
        MemoryRowSource::new(
            (0..n)
                .map(|i| Row::new(i, QuantizedVector::encode(&[i as f32, 1.0]).unwrap()))
                .collect(),
        )
    }

    #[test]
    fn test_paging_is_stable_and_bounded() {
        let source = source(10);
        assert_eq!(source.count().unwrap(), 10);

        let page = source.page(8, 5).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id.get(), 8);
        assert!(source.page(20, 5).unwrap().is_empty());
    }

    #[test]
    fn test_synthetic_corpus_is_reproducible() {
        let a = MemoryRowSource::synthetic(30, 8, 3, 7).unwrap();
        let b = MemoryRowSource::synthetic(30, 8, 3, 7).unwrap();
        assert_eq!(a.len(), 30);
        assert_eq!(a.vectors(), b.vectors());
        assert_eq!(a.vectors()[0].dimension().get(), 8);
        assert!(MemoryRowSource::synthetic(3, 0, 1, 7).is_err());
    }

    #[test]
    fn test_random_rows_are_distinct() {
        let source = source(50);
        let rows = source.random_rows(20).unwrap();
        assert_eq!(rows.len(), 20);

        let mut ids: Vec<u64> = rows.iter().map(|r| r.id.get()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 20);

        assert_eq!(source.random_rows(100).unwrap().len(), 50);
    }
}
