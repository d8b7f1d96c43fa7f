//! Bounded random sampling over sequential row streams.
//!
//! Staged datasets are compressed streams, so a sample never seeks: it
//! draws unique row indices, sorts them, and walks the stream once,
//! skipping the rows in between.

use crate::dnc::dataset::DatasetError;
use crate::vector::QuantizedVector;
use rand::Rng;

/// A forward-only source of fixed-width rows.
pub trait RowStream {
    /// Reads the next row, `None` at the end of the stream.
    fn read_row(&mut self) -> Result<Option<QuantizedVector>, DatasetError>;

    /// Discards the next `count` rows.
    fn skip_rows(&mut self, count: u64) -> Result<(), DatasetError> {
        for _ in 0..count {
            if self.read_row()?.is_none() {
                return Err(DatasetError::UnexpectedEnd);
            }
        }
        Ok(())
    }
}

/// Draws `size` unique indices from `0..total`, sorted ascending.
///
/// Returns every index when `size >= total`.
pub fn unique_indices<R: Rng + ?Sized>(rng: &mut R, total: usize, size: usize) -> Vec<usize> {
    if size >= total {
        return (0..total).collect();
    }
    let mut indices = rand::seq::index::sample(rng, total, size).into_vec();
    indices.sort_unstable();
    indices
}

/// Reads a uniform sample of at most `size` rows from a stream of `total`
/// rows, in stream order.
///
/// # Errors
/// `UnexpectedEnd` if the stream holds fewer rows than `total`.
pub fn sample_rows<S, R>(
    stream: &mut S,
    total: u64,
    size: usize,
    rng: &mut R,
) -> Result<Vec<QuantizedVector>, DatasetError>
where
    S: RowStream + ?Sized,
    R: Rng + ?Sized,
{
    let total = usize::try_from(total).map_err(|_| DatasetError::UnexpectedEnd)?;
    let indices = unique_indices(rng, total, size);

    let mut output = Vec::with_capacity(indices.len());
    let mut position = 0usize;
    for target in indices {
        stream.skip_rows((target - position) as u64)?;
        let row = stream.read_row()?.ok_or(DatasetError::UnexpectedEnd)?;
        output.push(row);
        position = target + 1;
    }
    Ok(output)
}
