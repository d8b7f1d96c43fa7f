//! Disk-backed staging for datasets too large to cluster in memory.
//!
//! A [`DatasetWriter`] spills fixed-width quantized rows into a compressed
//! scratch file. [`DatasetWriter::finalize`] closes the stream, computes the
//! dataset's representative centroid from a bounded sample, and returns a
//! [`DiskDataset`] that can be read front to back any number of times via
//! [`DiskDataset::reset`]. The scratch file is deleted when the dataset is
//! closed or dropped.

use crate::dnc::sampling::{RowStream, sample_rows};
use crate::storage::{CompressedWriter, CompressionService};
use crate::vector::{ClusteringError, HEADER_LEN, QuantizedVector, VectorError, kmeans_clustering};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;
use thiserror::Error;

/// Errors raised while staging or reading a dataset.
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Scratch file I/O failed for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Scratch file '{path}' is corrupted: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    #[error("Row stream ended before the recorded row count")]
    UnexpectedEnd,

    #[error("Row width mismatch: expected {expected} bytes, got {actual}")]
    RowWidth { expected: usize, actual: usize },

    #[error(transparent)]
    Clustering(#[from] ClusteringError),

    #[error(transparent)]
    Vector(#[from] VectorError),
}

impl DatasetError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether the error should abort a whole build rather than one branch.
    ///
    /// Running out of disk space will not get better by retrying siblings.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Io { source, .. } => source.kind() == io::ErrorKind::StorageFull,
            _ => false,
        }
    }
}

/// Write half of a staged dataset.
pub struct DatasetWriter {
    writer: Box<dyn CompressedWriter>,
    path: TempPath,
    row_width: usize,
    rows: u64,
    compression: Arc<dyn CompressionService>,
}

impl DatasetWriter {
    /// Creates a uniquely named `*.cache` scratch file in `dir`.
    ///
    /// # Errors
    /// `RowWidth` if `row_width` cannot hold a quantized vector, `Io` if the
    /// file cannot be created.
    pub fn create(
        dir: &Path,
        row_width: usize,
        compression: Arc<dyn CompressionService>,
    ) -> Result<Self, DatasetError> {
        if row_width <= HEADER_LEN {
            return Err(DatasetError::RowWidth {
                expected: HEADER_LEN + 1,
                actual: row_width,
            });
        }
        let (file, path) = tempfile::Builder::new()
            .suffix(".cache")
            .tempfile_in(dir)
            .map_err(|e| DatasetError::io(dir, e))?
            .into_parts();
        let writer = compression
            .writer(file)
            .map_err(|e| DatasetError::io(&path, e))?;

        Ok(Self {
            writer,
            path,
            row_width,
            rows: 0,
            compression,
        })
    }

    /// Appends one row.
    pub fn write_row(&mut self, row: &QuantizedVector) -> Result<(), DatasetError> {
        if row.byte_len() != self.row_width {
            return Err(DatasetError::RowWidth {
                expected: self.row_width,
                actual: row.byte_len(),
            });
        }
        self.writer
            .write_all(row.as_bytes())
            .map_err(|e| DatasetError::io(&self.path, e))?;
        self.rows += 1;
        Ok(())
    }

    /// Rows written so far.
    #[must_use]
    pub fn rows(&self) -> u64 {
        self.rows
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes the stream and computes the representative centroid.
    ///
    /// The centroid is `k-means(k = 1)` over at most `sample_cap` uniformly
    /// sampled rows. An empty dataset has no centroid.
    pub fn finalize(self, sample_cap: usize, seed: Option<u64>) -> Result<DiskDataset, DatasetError> {
        let Self {
            writer,
            path,
            row_width,
            rows,
            compression,
        } = self;

        writer.finish().map_err(|e| DatasetError::io(&path, e))?;

        let reader = open_reader(&path, compression.as_ref())?;
        let mut dataset = DiskDataset {
            path,
            reader,
            row_width,
            rows,
            centroid: None,
            compression,
            buffer: vec![0; row_width],
        };

        if rows > 0 {
            let mut rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            };
            let sample = dataset.sample(sample_cap, &mut rng)?;
            let result = kmeans_clustering(&sample, 1, seed)?;
            dataset.centroid = result.centroids.into_iter().next();
        }

        Ok(dataset)
    }
}

fn open_reader(
    path: &Path,
    compression: &dyn CompressionService,
) -> Result<Box<dyn Read + Send>, DatasetError> {
    let file = File::open(path).map_err(|e| DatasetError::io(path, e))?;
    compression
        .reader(file)
        .map_err(|e| DatasetError::io(path, e))
}

/// A finalized, read-only staged dataset.
pub struct DiskDataset {
    path: TempPath,
    reader: Box<dyn Read + Send>,
    row_width: usize,
    rows: u64,
    centroid: Option<QuantizedVector>,
    compression: Arc<dyn CompressionService>,
    buffer: Vec<u8>,
}

impl std::fmt::Debug for DiskDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskDataset")
            .field("path", &self.path.to_path_buf())
            .field("row_width", &self.row_width)
            .field("rows", &self.rows)
            .field("compression", &self.compression.name())
            .finish()
    }
}

impl DiskDataset {
    #[must_use]
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Encoded width of every row in bytes.
    #[must_use]
    pub fn row_width(&self) -> usize {
        self.row_width
    }

    /// Representative centroid, `None` only for an empty dataset.
    #[must_use]
    pub fn centroid(&self) -> Option<&QuantizedVector> {
        self.centroid.as_ref()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reopens the stream at the first row.
    pub fn reset(&mut self) -> Result<(), DatasetError> {
        self.reader = open_reader(&self.path, self.compression.as_ref())?;
        Ok(())
    }

    /// Draws a uniform sample of at most `cap` rows and rewinds.
    pub fn sample<R: rand::Rng + ?Sized>(
        &mut self,
        cap: usize,
        rng: &mut R,
    ) -> Result<Vec<QuantizedVector>, DatasetError> {
        self.reset()?;
        let rows = self.rows;
        let sample = sample_rows(self, rows, cap, rng)?;
        self.reset()?;
        Ok(sample)
    }

    /// Releases the handle and deletes the scratch file.
    pub fn close(self) -> Result<(), DatasetError> {
        let Self { path, reader, .. } = self;
        drop(reader);
        let display = path.to_path_buf();
        path.close().map_err(|e| DatasetError::io(&display, e))
    }

    /// Fills `self.buffer`; returns bytes read before EOF.
    fn fill_buffer(&mut self) -> Result<usize, DatasetError> {
        let mut filled = 0;
        while filled < self.row_width {
            match self.reader.read(&mut self.buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(DatasetError::io(&self.path, e)),
            }
        }
        Ok(filled)
    }
}

impl RowStream for DiskDataset {
    fn read_row(&mut self) -> Result<Option<QuantizedVector>, DatasetError> {
        match self.fill_buffer()? {
            0 => Ok(None),
            n if n == self.row_width => Ok(Some(QuantizedVector::from_bytes(self.buffer.clone())?)),
            n => Err(DatasetError::Corrupted {
                path: self.path.to_path_buf(),
                reason: format!("truncated row: {n} of {} bytes", self.row_width),
            }),
        }
    }

    fn skip_rows(&mut self, count: u64) -> Result<(), DatasetError> {
        let bytes = count * self.row_width as u64;
        let copied = io::copy(&mut (&mut *self.reader).take(bytes), &mut io::sink())
            .map_err(|e| DatasetError::io(&self.path, e))?;
        if copied != bytes {
            return Err(DatasetError::UnexpectedEnd);
        }
        Ok(())
    }
}
