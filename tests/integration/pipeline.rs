//! End-to-end: stage, build, prune, serve and search.

use ivfstore::dnc::prune_small_leaves;
use ivfstore::serving::CacheLayout;
use ivfstore::storage::{Lz4Compression, NoCompression};
use ivfstore::{
    BuildConfig, CompressionService, DncBuilder, MemoryRowSource, RowSource, ServingCache,
    ServingConfig, VectorId,
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn build_config() -> BuildConfig {
    BuildConfig {
        leaf_size: 250,
        split_factor: 3,
        sample_size: 600,
        parallel_threads: 2,
        batch_size: 128,
        seed: Some(11),
    }
}

fn serving_config() -> ServingConfig {
    ServingConfig {
        per_file_target: 200,
        min_centroid_files: 2,
        page_size: 128,
        ..ServingConfig::default()
    }
}

fn query_row(source: &MemoryRowSource, id: u64) -> ivfstore::QuantizedVector {
    source
        .page(id, 1)
        .unwrap()
        .into_iter()
        .next()
        .map(|row| row.vector)
        .unwrap()
}

#[test]
fn test_bulk_build_serves_every_row() {
    let temp_dir = TempDir::new().unwrap();
    let compression: Arc<dyn CompressionService> = Arc::new(Lz4Compression);
    let source = MemoryRowSource::synthetic(2_000, 16, 4, 11).unwrap();
    let cancel = CancellationToken::new();

    let builder = DncBuilder::new(
        build_config(),
        compression.clone(),
        temp_dir.path().join("scratch"),
    )
    .unwrap();
    let root = builder.stage(source.vectors()).unwrap();
    let (leaves, report) = builder.collect(root, &cancel).unwrap();

    assert!(!report.cancelled);
    assert_eq!(report.rows, 2_000);
    assert_eq!(report.leaves as usize, leaves.len());
    assert!(leaves.len() > 1);
    assert_eq!(leaves.iter().map(|l| l.rows).sum::<u64>(), 2_000);

    let kept = prune_small_leaves(leaves, 25);
    assert_eq!(kept.iter().map(|l| l.rows).sum::<u64>(), 2_000);
    let centroids: Vec<_> = kept.iter().map(|l| l.centroid.clone()).collect();

    let cache = ServingCache::open(temp_dir.path().join("cache"), serving_config(), compression)
        .unwrap();
    let refresh = cache
        .refresh_with_centroids(&source, &centroids, &cancel)
        .unwrap();
    assert_eq!(refresh.layout, CacheLayout::Partitioned);
    assert_eq!(refresh.rows, 2_000);
    assert_eq!(refresh.files, centroids.len());
    assert_eq!(cache.count(), 2_000);

    let infos = cache.centroids().unwrap();
    assert_eq!(infos.iter().map(|i| i.rows).sum::<u64>(), 2_000);

    let query = query_row(&source, 17);
    let hits = cache.search(&query, centroids.len(), 5, 0).unwrap();
    assert_eq!(hits.len(), 5);
    assert!(hits.iter().any(|hit| hit.id == VectorId::new(17)));
    assert!(hits[0].score > 0.99);
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
}

#[test]
fn test_streaming_refresh_matches_source_count() {
    let temp_dir = TempDir::new().unwrap();
    let source = MemoryRowSource::synthetic(1_500, 8, 3, 5).unwrap();
    let cache = ServingCache::open(temp_dir.path(), serving_config(), Arc::new(NoCompression))
        .unwrap();

    let report = cache.refresh(&source, &CancellationToken::new()).unwrap();
    assert_eq!(report.layout, CacheLayout::Partitioned);
    assert_eq!(report.rows, 1_500);
    assert_eq!(report.files, 8);
    assert!(report.batches > 0);

    let query = query_row(&source, 1_234);
    let best = cache.search(&query, report.files, 1, 0).unwrap();
    assert_eq!(best.len(), 1);
    assert!(best[0].score > 0.99);

    // paging past the first hit returns the next ones in order
    let page = cache.search(&query, report.files, 3, 1).unwrap();
    let full = cache.search(&query, report.files, 4, 0).unwrap();
    assert_eq!(page, full[1..].to_vec());
}

#[test]
fn test_rebuild_replaces_previous_layout() {
    let temp_dir = TempDir::new().unwrap();
    let cache = ServingCache::open(temp_dir.path(), serving_config(), Arc::new(Lz4Compression))
        .unwrap();
    let cancel = CancellationToken::new();

    let large = MemoryRowSource::synthetic(1_000, 8, 2, 1).unwrap();
    cache.refresh(&large, &cancel).unwrap();
    assert_eq!(cache.layout(), CacheLayout::Partitioned);

    let small = MemoryRowSource::synthetic(100, 8, 2, 1).unwrap();
    let report = cache.refresh(&small, &cancel).unwrap();
    assert_eq!(report.layout, CacheLayout::Flat);
    assert_eq!(cache.count(), 100);

    let cache_files = std::fs::read_dir(temp_dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "cache"))
        .count();
    assert_eq!(cache_files, 1);
}

#[test]
fn test_cancelled_pipeline_keeps_every_row_accounted() {
    let temp_dir = TempDir::new().unwrap();
    let compression: Arc<dyn CompressionService> = Arc::new(Lz4Compression);
    let source = MemoryRowSource::synthetic(1_200, 8, 3, 2).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let builder = DncBuilder::new(
        build_config(),
        compression.clone(),
        temp_dir.path().join("scratch"),
    )
    .unwrap();
    let root = builder.stage(source.vectors()).unwrap();
    let (leaves, report) = builder.collect(root, &cancel).unwrap();
    assert!(report.cancelled);
    assert_eq!(leaves.iter().map(|l| l.rows).sum::<u64>(), 1_200);

    let centroids: Vec<_> = leaves.iter().map(|l| l.centroid.clone()).collect();
    let cache = ServingCache::open(temp_dir.path().join("cache"), serving_config(), compression)
        .unwrap();
    let refresh = cache
        .refresh_with_centroids(&source, &centroids, &cancel)
        .unwrap();
    assert!(refresh.cancelled);
    assert_eq!(refresh.rows, 0);
    assert_eq!(refresh.files, centroids.len());
}
