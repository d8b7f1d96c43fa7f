//! On-disk record files backing the serving cache.
//!
//! Layout:
//!
//! ```text
//! [updated: u64 LE unix seconds][rows: u64 LE]   16 bytes, uncompressed
//! [id: u64 LE][quantized vector] * rows          compressed stream
//! ```
//!
//! The row count is written as zero when the file is created and patched in
//! place once the compressed stream is finished, so a file whose writer
//! never finished reads back as empty.

use crate::serving::ServingError;
use crate::storage::{CompressedWriter, CompressionService};
use crate::vector::{QuantizedVector, VectorId};
use chrono::{DateTime, Utc};
use parking_lot::{RawRwLock, RwLock};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Size of the uncompressed file header in bytes.
pub const FILE_HEADER_LEN: u64 = 16;

const ID_LEN: usize = 8;

/// One stored `(id, vector)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: VectorId,
    pub vector: QuantizedVector,
}

/// A finished record file and its header values.
#[derive(Debug)]
pub struct CentroidFile {
    path: PathBuf,
    vector_len: usize,
    rows: u64,
    updated: DateTime<Utc>,
    lock: Arc<RwLock<()>>,
}

impl CentroidFile {
    /// Creates (or truncates) `path` and returns a writer for it.
    pub fn create(
        path: impl Into<PathBuf>,
        vector_len: usize,
        compression: &dyn CompressionService,
    ) -> Result<CentroidWriter, ServingError> {
        let path = path.into();
        let lock = Arc::new(RwLock::new(()));
        let guard = lock.write_arc();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| ServingError::io(&path, e))?;

        let updated = Utc::now();
        write_header(&mut file, updated, 0).map_err(|e| ServingError::io(&path, e))?;
        let writer = compression
            .writer(file)
            .map_err(|e| ServingError::io(&path, e))?;

        Ok(CentroidWriter {
            path,
            vector_len,
            rows: 0,
            updated,
            writer,
            lock,
            _guard: guard,
        })
    }

    /// Opens an existing file and validates its header.
    pub fn open(path: impl Into<PathBuf>, vector_len: usize) -> Result<Self, ServingError> {
        let path = path.into();
        let mut file = File::open(&path).map_err(|e| ServingError::corrupted(&path, e))?;
        let (updated, rows) = read_header(&mut file, &path)?;
        Ok(Self {
            path,
            vector_len,
            rows,
            updated,
            lock: Arc::new(RwLock::new(())),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record count from the header.
    #[must_use]
    pub fn rows(&self) -> u64 {
        self.rows
    }

    #[must_use]
    pub fn updated(&self) -> DateTime<Utc> {
        self.updated
    }

    /// Encoded byte width of every vector in the file.
    #[must_use]
    pub fn vector_len(&self) -> usize {
        self.vector_len
    }

    /// Opens a lazy record reader. The file's read lock is held until the
    /// reader is dropped.
    pub fn reader(
        &self,
        compression: &dyn CompressionService,
    ) -> Result<CentroidReader, ServingError> {
        let guard = self.lock.read_arc();
        let mut file = File::open(&self.path).map_err(|e| ServingError::corrupted(&self.path, e))?;
        let (_, rows) = read_header(&mut file, &self.path)?;
        let stream = compression
            .reader(file)
            .map_err(|e| ServingError::corrupted(&self.path, e))?;

        Ok(CentroidReader {
            path: self.path.clone(),
            stream,
            remaining: rows,
            buffer: vec![0; ID_LEN + self.vector_len],
            failed: false,
            _guard: guard,
        })
    }
}

/// Streaming writer for a new record file.
pub struct CentroidWriter {
    path: PathBuf,
    vector_len: usize,
    rows: u64,
    updated: DateTime<Utc>,
    writer: Box<dyn CompressedWriter>,
    lock: Arc<RwLock<()>>,
    _guard: ArcRwLockWriteGuard<RawRwLock, ()>,
}

impl CentroidWriter {
    pub fn write_record(&mut self, id: VectorId, vector: &QuantizedVector) -> Result<(), ServingError> {
        if vector.byte_len() != self.vector_len {
            return Err(ServingError::InvalidArgument(format!(
                "record {id} is {} bytes, file '{}' stores {} byte vectors",
                vector.byte_len(),
                self.path.display(),
                self.vector_len
            )));
        }
        self.writer
            .write_all(&id.to_bytes())
            .and_then(|()| self.writer.write_all(vector.as_bytes()))
            .map_err(|e| ServingError::io(&self.path, e))?;
        self.rows += 1;
        Ok(())
    }

    /// Records written so far.
    #[must_use]
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Closes the stream, patches the row count and syncs the file.
    pub fn finish(self) -> Result<CentroidFile, ServingError> {
        let Self {
            path,
            vector_len,
            rows,
            updated,
            writer,
            lock,
            _guard: guard,
        } = self;

        let mut file = writer.finish().map_err(|e| ServingError::io(&path, e))?;
        write_header(&mut file, updated, rows)
            .and_then(|()| file.sync_all())
            .map_err(|e| ServingError::io(&path, e))?;

        drop(guard);
        Ok(CentroidFile {
            path,
            vector_len,
            rows,
            updated,
            lock,
        })
    }
}

/// Lazy iterator over the records of one file.
///
/// Yields at most the header's row count. A stream that ends early or fails
/// to decode yields one `Corrupted` error and then stops.
pub struct CentroidReader {
    path: PathBuf,
    stream: Box<dyn Read + Send>,
    remaining: u64,
    buffer: Vec<u8>,
    failed: bool,
    _guard: ArcRwLockReadGuard<RawRwLock, ()>,
}

impl CentroidReader {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records not yet read.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    fn read_record(&mut self) -> Result<Record, ServingError> {
        self.stream
            .read_exact(&mut self.buffer)
            .map_err(|e| ServingError::corrupted(&self.path, e))?;
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(&self.buffer[..ID_LEN]);
        let vector = QuantizedVector::from_bytes(self.buffer[ID_LEN..].to_vec()).map_err(|e| {
            ServingError::Corrupted {
                path: self.path.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(Record {
            id: VectorId::from_bytes(id),
            vector,
        })
    }
}

impl Iterator for CentroidReader {
    type Item = Result<Record, ServingError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let record = self.read_record();
        if record.is_err() {
            self.failed = true;
        }
        Some(record)
    }
}

impl std::fmt::Debug for CentroidReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CentroidReader")
            .field("path", &self.path)
            .field("remaining", &self.remaining)
            .finish()
    }
}

fn write_header(file: &mut File, updated: DateTime<Utc>, rows: u64) -> io::Result<()> {
    let seconds = u64::try_from(updated.timestamp()).unwrap_or(0);
    let mut header = [0u8; FILE_HEADER_LEN as usize];
    header[..8].copy_from_slice(&seconds.to_le_bytes());
    header[8..].copy_from_slice(&rows.to_le_bytes());
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)
}

/// Reads the header and leaves `file` positioned at the compressed stream.
fn read_header(file: &mut File, path: &Path) -> Result<(DateTime<Utc>, u64), ServingError> {
    let mut header = [0u8; FILE_HEADER_LEN as usize];
    file.read_exact(&mut header)
        .map_err(|e| ServingError::corrupted(path, e))?;

    let mut seconds = [0u8; 8];
    seconds.copy_from_slice(&header[..8]);
    let mut rows = [0u8; 8];
    rows.copy_from_slice(&header[8..]);

    let seconds = i64::try_from(u64::from_le_bytes(seconds)).map_err(|_| ServingError::Corrupted {
        path: path.to_path_buf(),
        reason: "update time out of range".to_string(),
    })?;
    let updated = DateTime::from_timestamp(seconds, 0).ok_or_else(|| ServingError::Corrupted {
        path: path.to_path_buf(),
        reason: "update time out of range".to_string(),
    })?;
    Ok((updated, u64::from_le_bytes(rows)))
}
