//! The serving cache: rebuilds from a row source and answers scans.
//!
//! One `RwLock` guards the active file set. A rebuild takes the write lock
//! for its whole duration, so queries wait for it rather than seeing a half
//! built cache. A query takes the read lock and keeps it, together with
//! the read lock of every file it opened, until its [`CentroidScan`] is
//! released.

use crate::serving::centroid_file::{CentroidFile, CentroidReader, CentroidWriter, Record};
use crate::serving::{ServingConfig, ServingError};
use crate::source::{Row, RowSource};
use crate::storage::CompressionService;
use crate::vector::{
    CentroidIndex, CosinePlan, IvfIndex, Matrix, QuantizedVector, VectorError, VectorId,
    cosine_similarity,
};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, bounded};
use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{RawRwLock, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FLAT_FILE_NAME: &str = "database.cache";

/// Records scored per similarity call during a search.
const SEARCH_BATCH: usize = 1024;

fn centroid_file_name(index: usize) -> String {
    format!("centroid_{index}.cache")
}

#[derive(Debug, Default)]
enum Layout {
    #[default]
    Empty,
    Flat(CentroidFile),
    Partitioned {
        index: IvfIndex,
        files: Vec<CentroidFile>,
    },
}

impl Layout {
    fn kind(&self) -> CacheLayout {
        match self {
            Self::Empty => CacheLayout::Empty,
            Self::Flat(_) => CacheLayout::Flat,
            Self::Partitioned { .. } => CacheLayout::Partitioned,
        }
    }

    fn files(&self) -> &[CentroidFile] {
        match self {
            Self::Empty => &[],
            Self::Flat(file) => std::slice::from_ref(file),
            Self::Partitioned { files, .. } => files,
        }
    }
}

/// Shape of the currently installed cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLayout {
    /// Nothing built yet, or the source was empty.
    Empty,
    /// One unpartitioned file.
    Flat,
    /// One file per centroid.
    Partitioned,
}

impl std::fmt::Display for CacheLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty"),
            Self::Flat => write!(f, "flat"),
            Self::Partitioned => write!(f, "partitioned"),
        }
    }
}

/// Outcome of a rebuild.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub layout: CacheLayout,
    /// Rows written to cache files.
    pub rows: u64,
    /// Number of cache files.
    pub files: usize,
    /// Mini-batches seen by the streaming trainer.
    pub batches: u64,
    /// The load stopped early; the installed files hold a prefix of the source.
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

/// Read-only snapshot of one centroid.
#[derive(Debug, Clone)]
pub struct CentroidInfo {
    pub index: CentroidIndex,
    pub vector: QuantizedVector,
    pub path: PathBuf,
    pub rows: u64,
    pub updated: DateTime<Utc>,
}

/// A scored search result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub id: VectorId,
    pub score: f32,
}

/// Open readers over the files selected for one query.
///
/// Holds the cache's shared lock until [`CentroidScan::release`] is called
/// or the scan is dropped, so no rebuild can replace the files underneath.
pub struct CentroidScan {
    total: u64,
    readers: Vec<CentroidReader>,
    guard: Option<ArcRwLockReadGuard<RawRwLock, Layout>>,
}

impl CentroidScan {
    /// Rows reachable through all readers.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Number of open readers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.readers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    pub fn readers_mut(&mut self) -> &mut [CentroidReader] {
        &mut self.readers
    }

    /// Every record of every reader, file by file.
    pub fn records(&mut self) -> impl Iterator<Item = Result<Record, ServingError>> + '_ {
        self.readers.iter_mut().flatten()
    }

    /// Closes the readers and releases the shared lock.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for CentroidScan {
    fn drop(&mut self) {
        // file locks go before the cache lock
        self.readers.clear();
        self.guard.take();
    }
}

impl std::fmt::Debug for CentroidScan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CentroidScan")
            .field("total", &self.total)
            .field("readers", &self.readers)
            .finish()
    }
}

#[derive(Debug, Default)]
struct PageProgress {
    rows: u64,
    cancelled: bool,
}

/// Centroid-partitioned on-disk cache of `(id, vector)` records.
pub struct ServingCache {
    root: PathBuf,
    config: ServingConfig,
    compression: Arc<dyn CompressionService>,
    state: Arc<RwLock<Layout>>,
}

impl std::fmt::Debug for ServingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServingCache")
            .field("root", &self.root)
            .field("compression", &self.compression.name())
            .field("layout", &self.layout())
            .finish()
    }
}

impl ServingCache {
    /// Opens an empty cache rooted at `root`, deleting any `*.cache` files
    /// left there by a previous process.
    pub fn open(
        root: impl Into<PathBuf>,
        config: ServingConfig,
        compression: Arc<dyn CompressionService>,
    ) -> Result<Self, ServingError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| ServingError::io(&root, e))?;
        let removed = remove_cache_files(&root)?;
        if removed > 0 {
            debug!(removed, root = %root.display(), "removed stale cache files");
        }

        Ok(Self {
            root,
            config,
            compression,
            state: Arc::new(RwLock::new(Layout::Empty)),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn config(&self) -> &ServingConfig {
        &self.config
    }

    #[must_use]
    pub fn layout(&self) -> CacheLayout {
        self.state.read().kind()
    }

    /// Rebuilds the cache from `source`, training a fresh IVF index while
    /// the rows stream through.
    ///
    /// Corpora smaller than `per_file_target * min_centroid_files` rows are
    /// written to a single flat file instead.
    pub fn refresh(
        &self,
        source: &dyn RowSource,
        cancel: &CancellationToken,
    ) -> Result<RefreshReport, ServingError> {
        let started = Instant::now();
        let mut state = self.state.write();
        self.clear(&mut state)?;

        let total = source.count()?;
        if total == 0 {
            info!("row source is empty, serving cache cleared");
            return Ok(report(&state, 0, false, started));
        }

        let Some(desired) = self.config.partitions(total) else {
            info!(total, "building flat serving cache");
            return self.build_flat(&mut state, source, cancel, started);
        };

        let seeds: Vec<QuantizedVector> = source
            .random_rows(desired)?
            .into_iter()
            .map(|row| row.vector)
            .collect();
        let index = IvfIndex::new(&seeds, self.config.learning_rate)?;
        let vector_len = seeds[0].byte_len();
        info!(
            total,
            centroids = index.len(),
            "building partitioned serving cache"
        );

        let mut writers = self.create_writers(index.len(), vector_len)?;
        let queue = self.config.queue_size.max(1);
        let (batch_tx, batch_rx) = bounded::<Vec<QuantizedVector>>(queue);
        let (assign_tx, assign_rx) = bounded::<Vec<usize>>(queue);

        let trainer = std::thread::Builder::new()
            .name("ivf-trainer".to_string())
            .spawn(move || {
                let mut index = index;
                let stats = index.train_streaming(batch_rx, assign_tx)?;
                Ok::<_, VectorError>((index, stats))
            })
            .map_err(|e| ServingError::Trainer(e.to_string()))?;

        // Pages whose assignments have not come back yet. Capping it at the
        // queue size makes the loader wait for the trainer.
        let mut pending: VecDeque<Vec<Row>> = VecDeque::with_capacity(queue + 1);
        let loaded = self.for_each_page(source, cancel, |page| {
            let vectors = page.iter().map(|row| row.vector.clone()).collect();
            batch_tx.send(vectors).map_err(|_| trainer_stopped())?;
            pending.push_back(page);
            while pending.len() > queue {
                write_assigned(&mut writers, &mut pending, &assign_rx)?;
            }
            Ok(())
        });
        drop(batch_tx);

        let loaded = loaded.and_then(|progress| {
            while !pending.is_empty() {
                write_assigned(&mut writers, &mut pending, &assign_rx)?;
            }
            Ok(progress)
        });
        drop(assign_rx);

        let (index, stats) = trainer
            .join()
            .map_err(|_| ServingError::Trainer("trainer thread panicked".to_string()))??;
        let progress = loaded?;

        let files = finish_writers(writers)?;
        let rows: u64 = files.iter().map(CentroidFile::rows).sum();
        *state = Layout::Partitioned { index, files };

        let mut report = report(&state, rows, progress.cancelled, started);
        report.batches = stats.batches;
        info!(
            rows,
            files = report.files,
            batches = stats.batches,
            elapsed_ms = report.elapsed_ms,
            "serving cache rebuilt"
        );
        Ok(report)
    }

    /// Rebuilds the cache around a fixed set of centroids, typically the
    /// leaves of a divide-and-conquer build.
    ///
    /// Every row goes to its most cosine-similar centroid. Each centroid is
    /// then moved to the quantized mean of its rows; a centroid that received
    /// none keeps its vector.
    pub fn refresh_with_centroids(
        &self,
        source: &dyn RowSource,
        centroids: &[QuantizedVector],
        cancel: &CancellationToken,
    ) -> Result<RefreshReport, ServingError> {
        if centroids.is_empty() {
            return Err(ServingError::InvalidArgument(
                "at least one centroid is required".to_string(),
            ));
        }
        let started = Instant::now();
        let fixed = Matrix::from_quantized(centroids)?;
        let dim = fixed.cols();

        let mut state = self.state.write();
        self.clear(&mut state)?;
        info!(centroids = centroids.len(), "materializing serving cache");

        let mut writers = self.create_writers(centroids.len(), centroids[0].byte_len())?;
        let mut sums = vec![0.0f64; centroids.len() * dim];
        let mut counts = vec![0u64; centroids.len()];
        let mut plan = CosinePlan::new();
        let mut rows = Matrix::with_capacity(dim, self.config.page_size);

        let progress = self.for_each_page(source, cancel, |page| {
            rows.clear();
            for row in &page {
                rows.push_quantized(&row.vector)?;
            }
            let similarity = plan.compute(&rows, &fixed)?;
            for (i, row) in page.iter().enumerate() {
                let c = similarity.nearest[i];
                writers[c].write_record(row.id, &row.vector)?;
                counts[c] += 1;
                for (acc, &v) in sums[c * dim..(c + 1) * dim].iter_mut().zip(rows.row(i)) {
                    *acc += f64::from(v);
                }
            }
            Ok(())
        })?;

        let recentered = centroids
            .iter()
            .enumerate()
            .map(|(c, original)| {
                if counts[c] == 0 {
                    return Ok(original.clone());
                }
                let count = counts[c] as f64;
                let mean: Vec<f32> = sums[c * dim..(c + 1) * dim]
                    .iter()
                    .map(|&sum| (sum / count) as f32)
                    .collect();
                QuantizedVector::encode(&mean)
            })
            .collect::<Result<Vec<_>, VectorError>>()?;

        let index = IvfIndex::new(&recentered, self.config.learning_rate)?;
        let files = finish_writers(writers)?;
        let total: u64 = files.iter().map(CentroidFile::rows).sum();
        *state = Layout::Partitioned { index, files };

        let report = report(&state, total, progress.cancelled, started);
        info!(
            rows = total,
            files = report.files,
            elapsed_ms = report.elapsed_ms,
            "serving cache materialized"
        );
        Ok(report)
    }

    /// Centroids closest to `query`, best first. Empty for a flat or unbuilt
    /// cache.
    pub fn nearest_centroids(
        &self,
        query: &QuantizedVector,
        k: usize,
    ) -> Result<Vec<(CentroidIndex, f32)>, ServingError> {
        match &*self.state.read() {
            Layout::Partitioned { index, .. } => Ok(index.nearest_centroids(query, k)?),
            _ => Ok(Vec::new()),
        }
    }

    /// Opens readers over the `k` centroid files nearest to `query`, or over
    /// the single file of a flat cache.
    pub fn centroid_readers(
        &self,
        query: &QuantizedVector,
        k: usize,
    ) -> Result<CentroidScan, ServingError> {
        let guard = self.state.read_arc();
        let compression = self.compression.as_ref();

        let mut total = 0;
        let mut readers = Vec::new();
        match &*guard {
            Layout::Empty => {}
            Layout::Flat(file) => {
                total = file.rows();
                readers.push(file.reader(compression)?);
            }
            Layout::Partitioned { index, files } => {
                for (centroid, _) in index.nearest_centroids(query, k)? {
                    let file = &files[centroid.get()];
                    total += file.rows();
                    readers.push(file.reader(compression)?);
                }
            }
        }

        Ok(CentroidScan {
            total,
            readers,
            guard: Some(guard),
        })
    }

    /// Scans the `centroids` nearest files and returns the `count` best
    /// matches after skipping the first `offset`, best first.
    pub fn search(
        &self,
        query: &QuantizedVector,
        centroids: usize,
        count: usize,
        offset: usize,
    ) -> Result<Vec<SearchHit>, ServingError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let keep = count.saturating_add(offset);
        let target = query.decode();

        let mut scan = self.centroid_readers(query, centroids)?;
        debug!(
            files = scan.len(),
            rows = scan.total(),
            "scanning serving cache"
        );

        let mut best: Vec<SearchHit> = Vec::new();
        let mut ids: Vec<VectorId> = Vec::with_capacity(SEARCH_BATCH);
        let mut batch = Matrix::with_capacity(target.len(), SEARCH_BATCH);
        for record in scan.records() {
            let record = record?;
            batch.push_quantized(&record.vector)?;
            ids.push(record.id);
            if ids.len() == SEARCH_BATCH {
                score_batch(&target, &mut batch, &mut ids, &mut best, keep)?;
            }
        }
        score_batch(&target, &mut batch, &mut ids, &mut best, keep)?;
        scan.release();

        Ok(best.into_iter().skip(offset).collect())
    }

    /// Rows held by the installed cache files.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.state.read().files().iter().map(CentroidFile::rows).sum()
    }

    /// Time of the last rebuild, `None` before any build.
    #[must_use]
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.state
            .read()
            .files()
            .iter()
            .map(CentroidFile::updated)
            .max()
    }

    /// Snapshot of every centroid. Empty for a flat or unbuilt cache.
    pub fn centroids(&self) -> Result<Vec<CentroidInfo>, ServingError> {
        let state = self.state.read();
        let Layout::Partitioned { index, files } = &*state else {
            return Ok(Vec::new());
        };
        files
            .iter()
            .enumerate()
            .map(|(i, file)| {
                let index_slot = CentroidIndex::new(i);
                Ok(CentroidInfo {
                    index: index_slot,
                    vector: index.centroid(index_slot)?,
                    path: file.path().to_path_buf(),
                    rows: file.rows(),
                    updated: file.updated(),
                })
            })
            .collect()
    }

    fn clear(&self, state: &mut Layout) -> Result<(), ServingError> {
        *state = Layout::Empty;
        remove_cache_files(&self.root)?;
        Ok(())
    }

    fn create_writers(
        &self,
        count: usize,
        vector_len: usize,
    ) -> Result<Vec<CentroidWriter>, ServingError> {
        (0..count)
            .map(|i| {
                CentroidFile::create(
                    self.root.join(centroid_file_name(i)),
                    vector_len,
                    self.compression.as_ref(),
                )
            })
            .collect()
    }

    fn build_flat(
        &self,
        state: &mut Layout,
        source: &dyn RowSource,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<RefreshReport, ServingError> {
        let path = self.root.join(FLAT_FILE_NAME);
        let mut writer: Option<CentroidWriter> = None;

        let progress = self.for_each_page(source, cancel, |page| {
            for row in &page {
                if writer.is_none() {
                    writer = Some(CentroidFile::create(
                        &path,
                        row.vector.byte_len(),
                        self.compression.as_ref(),
                    )?);
                }
                if let Some(writer) = writer.as_mut() {
                    writer.write_record(row.id, &row.vector)?;
                }
            }
            Ok(())
        })?;

        if let Some(writer) = writer {
            *state = Layout::Flat(writer.finish()?);
        }
        let rows: u64 = state.files().iter().map(CentroidFile::rows).sum();
        let report = report(state, rows, progress.cancelled, started);
        info!(rows, elapsed_ms = report.elapsed_ms, "flat serving cache rebuilt");
        Ok(report)
    }

    /// Feeds the source to `f` one page at a time until a short page or
    /// cancellation.
    fn for_each_page<F>(
        &self,
        source: &dyn RowSource,
        cancel: &CancellationToken,
        mut f: F,
    ) -> Result<PageProgress, ServingError>
    where
        F: FnMut(Vec<Row>) -> Result<(), ServingError>,
    {
        let page_size = self.config.page_size.max(1);
        let mut progress = PageProgress::default();
        loop {
            if cancel.is_cancelled() {
                warn!(
                    rows = progress.rows,
                    "serving cache load cancelled, installing partial files"
                );
                progress.cancelled = true;
                break;
            }
            let page = source.page(progress.rows, page_size)?;
            let len = page.len();
            if len == 0 {
                break;
            }
            progress.rows += len as u64;
            f(page)?;
            if len < page_size {
                break;
            }
        }
        Ok(progress)
    }
}

fn report(state: &Layout, rows: u64, cancelled: bool, started: Instant) -> RefreshReport {
    RefreshReport {
        layout: state.kind(),
        rows,
        files: state.files().len(),
        batches: 0,
        cancelled,
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    }
}

fn trainer_stopped() -> ServingError {
    ServingError::Trainer("trainer thread stopped early".to_string())
}

/// Writes the oldest pending page to the files its assignments name.
fn write_assigned(
    writers: &mut [CentroidWriter],
    pending: &mut VecDeque<Vec<Row>>,
    assignments: &Receiver<Vec<usize>>,
) -> Result<(), ServingError> {
    let Some(page) = pending.pop_front() else {
        return Ok(());
    };
    let assigned = assignments.recv().map_err(|_| trainer_stopped())?;
    for (row, centroid) in page.iter().zip(assigned) {
        let writer = writers.get_mut(centroid).ok_or_else(|| {
            ServingError::Trainer(format!("assignment to unknown centroid {centroid}"))
        })?;
        writer.write_record(row.id, &row.vector)?;
    }
    Ok(())
}

fn finish_writers(writers: Vec<CentroidWriter>) -> Result<Vec<CentroidFile>, ServingError> {
    writers.into_iter().map(CentroidWriter::finish).collect()
}

/// Scores the buffered batch and folds it into the running top `keep`.
fn score_batch(
    target: &[f32],
    batch: &mut Matrix,
    ids: &mut Vec<VectorId>,
    best: &mut Vec<SearchHit>,
    keep: usize,
) -> Result<(), ServingError> {
    if ids.is_empty() {
        return Ok(());
    }
    let scores = cosine_similarity(target, batch)?;
    best.extend(
        ids.drain(..)
            .zip(scores)
            .map(|(id, score)| SearchHit { id, score }),
    );
    best.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
    best.truncate(keep);
    batch.clear();
    Ok(())
}

fn remove_cache_files(root: &Path) -> Result<usize, ServingError> {
    let mut removed = 0;
    let entries = std::fs::read_dir(root).map_err(|e| ServingError::io(root, e))?;
    for entry in entries {
        let path = entry.map_err(|e| ServingError::io(root, e))?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "cache") {
            std::fs::remove_file(&path).map_err(|e| ServingError::io(&path, e))?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryRowSource;
    use crate::storage::{Lz4Compression, NoCompression};
    use tempfile::TempDir;

    fn q(values: &[f32]) -> QuantizedVector {
        QuantizedVector::encode(values).unwrap()
    }

    /// Rows spread over four directions in 4D, with per-row jitter.
    fn corpus(n: u64) -> MemoryRowSource {
        MemoryRowSource::new(
            (0..n)
                .map(|i| {
                    let mut v = [0.05f32; 4];
                    v[(i % 4) as usize] = 1.0;
                    v[((i + 1) % 4) as usize] += (i % 7) as f32 * 0.03;
                    Row::new(i, q(&v))
                })
                .collect(),
        )
    }

    fn config(per_file_target: usize, min_centroid_files: usize) -> ServingConfig {
        ServingConfig {
            per_file_target,
            min_centroid_files,
            learning_rate: 0.1,
            page_size: 16,
            queue_size: 2,
            default_centroids: 2,
        }
    }

    fn open(dir: &Path, config: ServingConfig) -> ServingCache {
        ServingCache::open(dir, config, Arc::new(Lz4Compression)).unwrap()
    }

    #[test]
    fn test_unbuilt_cache_returns_empty_results() {
        let temp_dir = TempDir::new().unwrap();
        let cache = open(temp_dir.path(), config(10, 2));
        let query = q(&[1.0, 0.0, 0.0, 0.0]);

        assert_eq!(cache.layout(), CacheLayout::Empty);
        assert!(cache.nearest_centroids(&query, 3).unwrap().is_empty());
        let scan = cache.centroid_readers(&query, 3).unwrap();
        assert_eq!(scan.total(), 0);
        assert!(scan.is_empty());
        scan.release();
        assert!(cache.search(&query, 3, 5, 0).unwrap().is_empty());
        assert_eq!(cache.count(), 0);
        assert!(cache.last_updated().is_none());
    }

    #[test]
    fn test_open_removes_stale_files() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("centroid_9.cache"), b"stale").unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), b"keep").unwrap();

        let _cache = open(temp_dir.path(), config(10, 2));
        assert!(!temp_dir.path().join("centroid_9.cache").exists());
        assert!(temp_dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_refresh_partitions_and_finds_self_match() {
        let temp_dir = TempDir::new().unwrap();
        let cache = open(temp_dir.path(), config(25, 2));
        let source = corpus(200);

        let report = cache.refresh(&source, &CancellationToken::new()).unwrap();
        assert_eq!(report.layout, CacheLayout::Partitioned);
        assert_eq!(report.files, 8);
        assert_eq!(report.rows, 200);
        assert!(!report.cancelled);
        assert!(report.batches > 0);
        assert_eq!(cache.count(), 200);
        assert!(cache.last_updated().is_some());

        let infos = cache.centroids().unwrap();
        assert_eq!(infos.len(), 8);
        assert_eq!(infos.iter().map(|c| c.rows).sum::<u64>(), 200);

        let target = source.page(42, 1).unwrap().remove(0);
        let hits = cache.search(&target.vector, 8, 3, 0).unwrap();
        assert_eq!(hits.len(), 3);
        assert!((hits[0].score - 1.0).abs() < 1e-3);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_reader_totals_match_file_rows() {
        let temp_dir = TempDir::new().unwrap();
        let cache = open(temp_dir.path(), config(25, 2));
        cache
            .refresh(&corpus(120), &CancellationToken::new())
            .unwrap();

        let query = q(&[0.0, 1.0, 0.0, 0.0]);
        let nearest = cache.nearest_centroids(&query, 2).unwrap();
        assert_eq!(nearest.len(), 2);

        let infos = cache.centroids().unwrap();
        let mut scan = cache.centroid_readers(&query, 2).unwrap();
        let expected: u64 = nearest.iter().map(|(c, _)| infos[c.get()].rows).sum();
        assert_eq!(scan.total(), expected);
        assert_eq!(scan.records().count() as u64, expected);
    }

    #[test]
    fn test_flat_mode_scans_single_file() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ServingCache::open(temp_dir.path(), config(100, 2), Arc::new(NoCompression))
            .unwrap();
        let source = corpus(50);

        let report = cache.refresh(&source, &CancellationToken::new()).unwrap();
        assert_eq!(report.layout, CacheLayout::Flat);
        assert_eq!(report.files, 1);
        assert!(temp_dir.path().join(FLAT_FILE_NAME).exists());

        let query = q(&[1.0, 0.05, 0.05, 0.05]);
        assert!(cache.nearest_centroids(&query, 4).unwrap().is_empty());
        assert_eq!(cache.centroid_readers(&query, 4).unwrap().total(), 50);
        assert!(cache.centroids().unwrap().is_empty());

        let hits = cache.search(&query, 4, 50, 0).unwrap();
        assert_eq!(hits.len(), 50);
        let skipped = cache.search(&query, 4, 5, 10).unwrap();
        assert_eq!(skipped, hits[10..15].to_vec());
    }

    #[test]
    fn test_empty_source_clears_cache() {
        let temp_dir = TempDir::new().unwrap();
        let cache = open(temp_dir.path(), config(10, 2));
        cache
            .refresh(&corpus(60), &CancellationToken::new())
            .unwrap();
        assert_eq!(cache.count(), 60);

        let report = cache
            .refresh(&MemoryRowSource::default(), &CancellationToken::new())
            .unwrap();
        assert_eq!(report.layout, CacheLayout::Empty);
        assert_eq!(cache.count(), 0);
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_refresh_with_centroids_recenters() {
        let temp_dir = TempDir::new().unwrap();
        let cache = open(temp_dir.path(), config(10, 2));
        let source = MemoryRowSource::new(vec![
            Row::new(1, q(&[1.0, 0.2])),
            Row::new(2, q(&[1.0, -0.2])),
            Row::new(3, q(&[-0.1, 1.0])),
        ]);
        let fixed = [q(&[1.0, 0.0]), q(&[0.0, 1.0]), q(&[-1.0, -1.0])];

        let report = cache
            .refresh_with_centroids(&source, &fixed, &CancellationToken::new())
            .unwrap();
        assert_eq!(report.files, 3);
        assert_eq!(report.rows, 3);

        let infos = cache.centroids().unwrap();
        assert_eq!(infos[0].rows, 2);
        assert_eq!(infos[1].rows, 1);
        assert_eq!(infos[2].rows, 0);
        // the empty centroid keeps its vector, the others move to their members
        assert_eq!(infos[2].vector, fixed[2]);
        assert_ne!(infos[0].vector, fixed[0]);
        let moved = infos[1].vector.decode();
        assert!((moved[0] + 0.1).abs() < 1e-2);
        assert!((moved[1] - 1.0).abs() < 1e-2);
    }

    #[test]
    fn test_cancelled_refresh_installs_partial_cache() {
        let temp_dir = TempDir::new().unwrap();
        let cache = open(temp_dir.path(), config(10, 2));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = cache.refresh(&corpus(100), &cancel).unwrap();
        assert!(report.cancelled);
        assert_eq!(report.layout, CacheLayout::Partitioned);
        assert_eq!(report.rows, 0);
        assert!(cache.search(&q(&[1.0, 0.0, 0.0, 0.0]), 3, 5, 0).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_centroid_file_is_corrupted() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ServingCache::open(temp_dir.path(), config(100, 2), Arc::new(NoCompression))
            .unwrap();
        cache.refresh(&corpus(50), &CancellationToken::new()).unwrap();

        let path = temp_dir.path().join(FLAT_FILE_NAME);
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(crate::serving::FILE_HEADER_LEN + 30).unwrap();
        drop(file);

        let err = cache
            .search(&q(&[1.0, 0.0, 0.0, 0.0]), 1, 5, 0)
            .unwrap_err();
        assert!(err.is_corrupted());
    }
}
