//! Similarity and clustering benchmarks
//!
//! Covers the hot paths of a search and a build:
//! - One query scored against a page of rows
//! - Routing a batch of rows to a fixed centroid set with a reused plan
//! - Full k-means over a sample

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use ivfstore::vector::{CosinePlan, Matrix, QuantizedVector, cosine_similarity, kmeans_clustering};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;

const DIMENSION: usize = 384;

fn random_rows(count: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| (0..DIMENSION).map(|_| rng.random_range(-1.0f32..1.0)).collect())
        .collect()
}

fn bench_query_scoring(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_scoring");
    let query = random_rows(1, 1).remove(0);

    for rows in [256usize, 1024, 4096] {
        let matrix = Matrix::from_rows(&random_rows(rows, 2)).expect("matrix");
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::new("cosine_similarity", rows), &matrix, |b, m| {
            b.iter(|| black_box(cosine_similarity(black_box(&query), m).expect("scores")));
        });
    }

    group.finish();
}

fn bench_batch_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_routing");
    let batch = Matrix::from_rows(&random_rows(1024, 3)).expect("batch");

    for centroids in [8usize, 64, 256] {
        let fixed = Matrix::from_rows(&random_rows(centroids, 4)).expect("centroids");
        group.throughput(Throughput::Elements(1024));
        group.bench_with_input(
            BenchmarkId::new("cosine_plan", centroids),
            &fixed,
            |b, fixed| {
                let mut plan = CosinePlan::new();
                b.iter(|| {
                    let scores = plan.compute(black_box(&batch), fixed).expect("scores");
                    black_box(scores.score(0, 0))
                });
            },
        );
    }

    group.finish();
}

fn bench_kmeans(c: &mut Criterion) {
    let mut group = c.benchmark_group("kmeans");
    group.sample_size(10);

    let vectors: Vec<QuantizedVector> = random_rows(2000, 5)
        .iter()
        .map(|row| QuantizedVector::encode(row).expect("encode"))
        .collect();

    for k in [2usize, 8, 32] {
        group.bench_with_input(BenchmarkId::new("kmeans_clustering", k), &k, |b, &k| {
            b.iter(|| black_box(kmeans_clustering(black_box(&vectors), k, Some(7)).expect("kmeans")));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_query_scoring, bench_batch_routing, bench_kmeans);
criterion_main!(benches);
