//! Recursive divide-and-conquer index builder.
//!
//! Starting from one staged dataset, every task either emits the dataset's
//! representative as a [`Leaf`] or splits it:
//!
//! 1. sample at most `sample_size` rows
//! 2. k-means the sample with `k = min(split_factor, max(2, rows / leaf_size))`
//! 3. stream the dataset once, routing each row to its nearest child centroid
//!    into a new staged child dataset
//! 4. drop the parent (deleting its scratch file) and recurse into every
//!    non-empty child as an independent task
//!
//! Tasks run on a dedicated rayon pool. [`rayon::ThreadPool::scope`] is the
//! fan-in point: when [`DncBuilder::run`] returns, every task has finished
//! and the leaf sender has been dropped, which closes the output stream.
//!
//! The row counts of all emitted leaves always sum to the input row count,
//! including when branches fail or the build is cancelled.

use crate::dnc::dataset::{DatasetError, DatasetWriter, DiskDataset};
use crate::dnc::sampling::RowStream;
use crate::storage::CompressionService;
use crate::vector::{CosinePlan, Matrix, QuantizedVector, argmax, cosine, kmeans_clustering};
use crossbeam_channel::{Sender, unbounded};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, warn};

/// Tuning knobs for one build.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildConfig {
    /// Datasets at or below this many rows become leaves.
    pub leaf_size: u64,
    /// Upper bound on children per split.
    pub split_factor: usize,
    /// Rows sampled for each split and each representative.
    pub sample_size: usize,
    /// Worker threads in the build pool.
    pub parallel_threads: usize,
    /// Rows routed per similarity call while partitioning.
    pub batch_size: usize,
    /// Seed for reproducible sampling and initialization.
    pub seed: Option<u64>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            leaf_size: 10_000,
            split_factor: 2,
            sample_size: 50_000,
            parallel_threads: num_cpus::get(),
            batch_size: crate::vector::BATCH_SIZE,
            seed: None,
        }
    }
}

impl BuildConfig {
    /// Number of children a dataset of `rows` rows is split into.
    #[must_use]
    pub fn split_count(&self, rows: u64) -> usize {
        let wanted = (rows / self.leaf_size.max(1)).max(2);
        self.split_factor
            .max(2)
            .min(usize::try_from(wanted).unwrap_or(usize::MAX))
    }
}

/// One output cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    pub centroid: QuantizedVector,
    pub rows: u64,
}

/// Summary of a finished build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub leaves: u64,
    pub rows: u64,
    pub tasks: u64,
    pub failed_branches: u64,
    pub max_depth: usize,
    pub cancelled: bool,
}

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Build aborted: {0}\nSuggestion: Free disk space in the scratch directory and rebuild")]
    Fatal(#[source] DatasetError),

    #[error("Failed to stage input rows: {0}")]
    Staging(#[source] DatasetError),

    #[error("Cannot build from an empty input\nSuggestion: Load rows before building")]
    EmptyInput,

    #[error("Failed to create scratch directory '{path}': {source}")]
    ScratchDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to start build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// State shared by every task of one build.
struct BuildState<'a> {
    sink: Sender<Leaf>,
    cancel: &'a CancellationToken,
    stop: AtomicBool,
    fatal: Mutex<Option<DatasetError>>,
    next_task: AtomicU64,
    leaves: AtomicU64,
    rows: AtomicU64,
    failed: AtomicU64,
    max_depth: AtomicUsize,
}

impl BuildState<'_> {
    fn emit(&self, centroid: QuantizedVector, rows: u64) {
        self.leaves.fetch_add(1, Ordering::Relaxed);
        self.rows.fetch_add(rows, Ordering::Relaxed);
        if self.sink.send(Leaf { centroid, rows }).is_err() {
            debug!("leaf receiver dropped, stopping build");
            self.stop.store(true, Ordering::Relaxed);
        }
    }

    fn abort(&self, error: DatasetError) {
        self.stop.store(true, Ordering::Relaxed);
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(error);
        }
    }
}

enum Split {
    Children(Vec<DiskDataset>),
    /// Every sampled row is identical, or every row routed to one child.
    Unsplittable,
}

/// Bulk index builder.
pub struct DncBuilder {
    config: BuildConfig,
    compression: Arc<dyn CompressionService>,
    scratch_dir: PathBuf,
    pool: rayon::ThreadPool,
}

impl DncBuilder {
    /// Creates a builder with its own thread pool. `scratch_dir` is created
    /// if missing.
    pub fn new(
        config: BuildConfig,
        compression: Arc<dyn CompressionService>,
        scratch_dir: impl Into<PathBuf>,
    ) -> Result<Self, BuildError> {
        let scratch_dir = scratch_dir.into();
        std::fs::create_dir_all(&scratch_dir).map_err(|source| BuildError::ScratchDir {
            path: scratch_dir.clone(),
            source,
        })?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.parallel_threads.max(1))
            .thread_name(|i| format!("dnc-worker-{i}"))
            .build()?;

        Ok(Self {
            config,
            compression,
            scratch_dir,
            pool,
        })
    }

    #[must_use]
    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    #[must_use]
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Spills rows into a root dataset ready for [`DncBuilder::run`].
    pub fn stage<I>(&self, rows: I) -> Result<DiskDataset, BuildError>
    where
        I: IntoIterator<Item = QuantizedVector>,
    {
        let mut rows = rows.into_iter().peekable();
        let width = rows
            .peek()
            .map(QuantizedVector::byte_len)
            .ok_or(BuildError::EmptyInput)?;

        let mut writer = DatasetWriter::create(&self.scratch_dir, width, self.compression.clone())
            .map_err(BuildError::Staging)?;
        for row in rows {
            writer.write_row(&row).map_err(BuildError::Staging)?;
        }
        debug!(rows = writer.rows(), "staged root dataset");
        writer
            .finalize(self.config.sample_size, self.config.seed)
            .map_err(BuildError::Staging)
    }

    /// Runs the recursive build, sending every leaf to `sink`.
    ///
    /// Cancellation is observed at each task entry: a cancelled task emits
    /// its representative and stops splitting, so the output still covers
    /// every row. The report's `cancelled` flag records this.
    ///
    /// # Errors
    /// `Fatal` when a task hit an unrecoverable error such as a full disk.
    pub fn run(
        &self,
        root: DiskDataset,
        cancel: &CancellationToken,
        sink: Sender<Leaf>,
    ) -> Result<BuildReport, BuildError> {
        let input_rows = root.rows();
        info!(
            rows = input_rows,
            leaf_size = self.config.leaf_size,
            threads = self.pool.current_num_threads(),
            "starting divide-and-conquer build"
        );

        let state = BuildState {
            sink,
            cancel,
            stop: AtomicBool::new(false),
            fatal: Mutex::new(None),
            next_task: AtomicU64::new(0),
            leaves: AtomicU64::new(0),
            rows: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            max_depth: AtomicUsize::new(0),
        };

        self.pool
            .scope(|scope| self.process(scope, root, &state, 0));

        let BuildState {
            sink,
            fatal,
            next_task,
            leaves,
            rows,
            failed,
            max_depth,
            ..
        } = state;
        drop(sink);

        if let Some(error) = fatal.into_inner() {
            return Err(BuildError::Fatal(error));
        }

        let report = BuildReport {
            leaves: leaves.into_inner(),
            rows: rows.into_inner(),
            tasks: next_task.into_inner(),
            failed_branches: failed.into_inner(),
            max_depth: max_depth.into_inner(),
            cancelled: cancel.is_cancelled(),
        };
        if report.cancelled {
            warn!(leaves = report.leaves, "build cancelled, emitted partial leaves");
        }
        info!(
            leaves = report.leaves,
            rows = report.rows,
            tasks = report.tasks,
            failed = report.failed_branches,
            depth = report.max_depth,
            "divide-and-conquer build finished"
        );
        Ok(report)
    }

    /// Runs the build and gathers every leaf.
    pub fn collect(
        &self,
        root: DiskDataset,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Leaf>, BuildReport), BuildError> {
        let (tx, rx) = unbounded();
        let report = self.run(root, cancel, tx)?;
        Ok((rx.into_iter().collect(), report))
    }

    fn process<'s>(
        &'s self,
        scope: &rayon::Scope<'s>,
        dataset: DiskDataset,
        state: &'s BuildState<'s>,
        depth: usize,
    ) {
        let task = state.next_task.fetch_add(1, Ordering::Relaxed);
        let span = debug_span!("dnc_task", task, depth, rows = dataset.rows());
        let _enter = span.enter();
        state.max_depth.fetch_max(depth, Ordering::Relaxed);

        if state.stop.load(Ordering::Relaxed) {
            return;
        }
        let rows = dataset.rows();
        let Some(parent) = dataset.centroid().cloned() else {
            return;
        };

        if rows <= self.config.leaf_size || state.cancel.is_cancelled() {
            state.emit(parent, rows);
            return;
        }

        let seed = self
            .config
            .seed
            .map(|s| s ^ task.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        match self.partition(dataset, seed) {
            Ok(Split::Children(children)) => {
                debug!(children = children.len(), "split dataset");
                for child in children {
                    scope.spawn(move |s| self.process(s, child, state, depth + 1));
                }
            }
            Ok(Split::Unsplittable) => state.emit(parent, rows),
            Err(error) if error.is_fatal() => {
                warn!(%error, "fatal error during partition, aborting build");
                state.abort(error);
            }
            Err(error) => {
                warn!(%error, "branch failed, emitting parent representative");
                state.failed.fetch_add(1, Ordering::Relaxed);
                state.emit(parent, rows);
            }
        }
    }

    fn partition(&self, mut dataset: DiskDataset, seed: Option<u64>) -> Result<Split, DatasetError> {
        let rows = dataset.rows();
        let k = self.config.split_count(rows);

        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let sample = dataset.sample(self.config.sample_size, &mut rng)?;
        let clusters = kmeans_clustering(&sample, k, seed)?;
        if clusters.centroids.len() < 2 {
            return Ok(Split::Unsplittable);
        }

        let centroids = Matrix::from_quantized(&clusters.centroids)?;
        let mut writers = clusters
            .centroids
            .iter()
            .map(|_| {
                DatasetWriter::create(
                    &self.scratch_dir,
                    dataset.row_width(),
                    self.compression.clone(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut plan = CosinePlan::new();
        let mut batch = Vec::with_capacity(self.config.batch_size);
        let mut routed = 0u64;
        while let Some(row) = dataset.read_row()? {
            batch.push(row);
            if batch.len() == self.config.batch_size {
                routed += route(&mut batch, &centroids, &mut plan, &mut writers)?;
            }
        }
        routed += route(&mut batch, &centroids, &mut plan, &mut writers)?;

        if routed != rows {
            return Err(DatasetError::Corrupted {
                path: dataset.path().to_path_buf(),
                reason: format!("expected {rows} rows, read {routed}"),
            });
        }
        dataset.close()?;

        let non_empty: Vec<DatasetWriter> =
            writers.into_iter().filter(|w| w.rows() > 0).collect();
        if non_empty.len() < 2 {
            return Ok(Split::Unsplittable);
        }

        let children = non_empty
            .into_iter()
            .map(|writer| writer.finalize(self.config.sample_size, seed))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Split::Children(children))
    }
}

/// Routes a batch to the writers of its nearest centroids and clears it.
fn route(
    batch: &mut Vec<QuantizedVector>,
    centroids: &Matrix,
    plan: &mut CosinePlan,
    writers: &mut [DatasetWriter],
) -> Result<u64, DatasetError> {
    if batch.is_empty() {
        return Ok(0);
    }
    let rows = Matrix::from_quantized(batch)?;
    let nearest = &plan.compute(&rows, centroids)?.nearest;
    for (row, &child) in batch.iter().zip(nearest) {
        writers[child].write_row(row)?;
    }
    let routed = batch.len() as u64;
    batch.clear();
    Ok(routed)
}

/// Drops leaves smaller than `min_rows`, folding each one's row count into
/// its most similar surviving leaf.
///
/// If no leaf reaches `min_rows` the largest one survives alone.
#[must_use]
pub fn prune_small_leaves(leaves: Vec<Leaf>, min_rows: u64) -> Vec<Leaf> {
    let (mut kept, mut small): (Vec<Leaf>, Vec<Leaf>) =
        leaves.into_iter().partition(|leaf| leaf.rows >= min_rows);

    if kept.is_empty() {
        let Some(largest) = small
            .iter()
            .enumerate()
            .max_by_key(|(_, leaf)| leaf.rows)
            .map(|(i, _)| i)
        else {
            return kept;
        };
        kept.push(small.swap_remove(largest));
    }

    let kept_vectors: Vec<Vec<f32>> = kept.iter().map(|l| l.centroid.decode()).collect();
    for leaf in small {
        let vector = leaf.centroid.decode();
        let scores: Vec<f32> = kept_vectors.iter().map(|k| cosine(&vector, k)).collect();
        kept[argmax(&scores)].rows += leaf.rows;
    }
    kept
}
