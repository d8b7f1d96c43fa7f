//! Readers, rebuilds and cache lookups running side by side.

use ivfstore::metadata::{CategoryCentroid, MetadataConfig, MetadataError};
use ivfstore::storage::Lz4Compression;
use ivfstore::{MetadataCache, MemoryRowSource, RowSource, ServingCache, ServingConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn serving_config() -> ServingConfig {
    ServingConfig {
        per_file_target: 100,
        min_centroid_files: 2,
        page_size: 64,
        ..ServingConfig::default()
    }
}

fn built_cache(temp_dir: &TempDir, source: &MemoryRowSource) -> Arc<ServingCache> {
    let cache = ServingCache::open(temp_dir.path(), serving_config(), Arc::new(Lz4Compression))
        .unwrap();
    cache.refresh(source, &CancellationToken::new()).unwrap();
    Arc::new(cache)
}

#[test]
fn test_refresh_waits_for_open_scan() {
    let temp_dir = TempDir::new().unwrap();
    let source = Arc::new(MemoryRowSource::synthetic(600, 8, 3, 9).unwrap());
    let cache = built_cache(&temp_dir, &source);
    let query = source.page(0, 1).unwrap().remove(0).vector;

    let mut scan = cache.centroid_readers(&query, 2).unwrap();
    let expected = scan.total();
    assert_eq!(scan.len(), 2);
    let per_file: u64 = scan.readers_mut().iter().map(|r| r.remaining()).sum();
    assert_eq!(per_file, expected);

    let finished = Arc::new(AtomicBool::new(false));
    let handle = {
        let cache = Arc::clone(&cache);
        let source = Arc::clone(&source);
        let finished = Arc::clone(&finished);
        thread::spawn(move || {
            let report = cache.refresh(&*source, &CancellationToken::new()).unwrap();
            finished.store(true, Ordering::SeqCst);
            report
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!finished.load(Ordering::SeqCst), "refresh ran under an open scan");

    let read = scan.records().filter(Result::is_ok).count() as u64;
    assert_eq!(read, expected);
    scan.release();

    let report = handle.join().unwrap();
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(report.rows, 600);
}

#[test]
fn test_parallel_searches_share_the_cache() {
    let temp_dir = TempDir::new().unwrap();
    let source = MemoryRowSource::synthetic(500, 8, 4, 3).unwrap();
    let cache = built_cache(&temp_dir, &source);
    let queries: Vec<_> = source
        .page(0, 8)
        .unwrap()
        .into_iter()
        .map(|row| row.vector)
        .collect();
    let files = cache.centroids().unwrap().len();

    thread::scope(|scope| {
        for query in &queries {
            let cache = &cache;
            scope.spawn(move || {
                let hits = cache.search(query, files, 3, 0).unwrap();
                assert_eq!(hits.len(), 3);
                assert!(hits[0].score > 0.99);
            });
        }
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_metadata_loads_served_centroids_once() {
    let temp_dir = TempDir::new().unwrap();
    let source = MemoryRowSource::synthetic(400, 8, 2, 21).unwrap();
    let serving = built_cache(&temp_dir, &source);
    let metadata = Arc::new(MetadataCache::new(&MetadataConfig::default()));
    let loads = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let metadata = Arc::clone(&metadata);
        let serving = Arc::clone(&serving);
        let loads = Arc::clone(&loads);
        tasks.push(tokio::spawn(async move {
            metadata
                .fetch_centroids(7, || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    serving
                        .centroids()
                        .map(|infos| {
                            infos
                                .into_iter()
                                .map(|info| CategoryCentroid {
                                    id: info.index.get() as u64,
                                    category_id: 7,
                                    vector: info.vector,
                                })
                                .collect::<Vec<_>>()
                        })
                        .map_err(|e| MetadataError::Loader(e.to_string()))
                })
                .await
        }));
    }

    for task in tasks {
        let centroids = task.await.unwrap().unwrap();
        assert_eq!(centroids.len(), 4);
    }
    assert_eq!(loads.load(Ordering::SeqCst), 1);
}
