//! B-tree and chunker benchmarks.
//!
//! Run with: cargo bench -p hashtree-core

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hashtree_core::{BTree, BTreeOptions, Chunker, HashTree, HashTreeConfig, Link, MemoryStore};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::ops::Bound;
use std::sync::Arc;

fn random_keys(count: usize) -> Vec<String> {
    let mut rng = StdRng::seed_from_u64(7);
    (0..count)
        .map(|_| format!("{:016x}", rng.gen::<u64>()))
        .collect()
}

fn link_for(i: usize) -> Link {
    Link::blob(hashtree_core::sha256(&i.to_be_bytes()), i as u64)
}

/// Incremental inserts into an empty tree
fn bench_inserts(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("btree_insert");

    for count in [100usize, 1000] {
        let keys = random_keys(count);
        group.throughput(Throughput::Elements(count as u64));
        for order in [8usize, 32] {
            group.bench_with_input(BenchmarkId::new(format!("order{}", order), count), &keys, |b, keys| {
                b.iter(|| {
                    rt.block_on(async {
                        let tree = HashTree::new(
                            HashTreeConfig::new(Arc::new(MemoryStore::new())).with_order(order),
                        )
                        .await
                        .unwrap();
                        for (i, key) in keys.iter().enumerate() {
                            tree.set(black_box(key), link_for(i)).await.unwrap();
                        }
                        tree.root().await
                    })
                })
            });
        }
    }

    group.finish();
}

/// Bulk build versus point reads and a full scan
fn bench_reads(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("btree_read");

    let keys = random_keys(10_000);
    let tree = BTree::new(Arc::new(MemoryStore::new()), BTreeOptions::default()).unwrap();
    let root = rt
        .block_on(tree.build(keys.iter().enumerate().map(|(i, k)| (k.clone(), link_for(i)))))
        .unwrap();

    group.bench_function("get_10k", |b| {
        b.iter(|| {
            rt.block_on(async {
                for key in keys.iter().take(100) {
                    black_box(tree.get(&root, key).await.unwrap());
                }
            })
        })
    });

    group.throughput(Throughput::Elements(keys.len() as u64));
    group.bench_function("scan_10k", |b| {
        b.iter(|| {
            rt.block_on(async {
                use futures::TryStreamExt;
                let n = tree
                    .range(&root, Bound::Unbounded, Bound::Unbounded)
                    .try_fold(0usize, |n, _| async move { Ok(n + 1) })
                    .await
                    .unwrap();
                black_box(n)
            })
        })
    });

    group.finish();
}

/// Chunked writes and a small range read from the middle
fn bench_chunker(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("chunker");

    let mut rng = StdRng::seed_from_u64(11);
    let data: Vec<u8> = (0..8 * 1024 * 1024).map(|_| rng.gen()).collect();
    group.throughput(Throughput::Bytes(data.len() as u64));

    for (name, chunk_size) in [("256KB", 256 * 1024), ("2MB", 2 * 1024 * 1024)] {
        group.bench_with_input(BenchmarkId::new("chunk", name), &data, |b, data| {
            b.iter(|| {
                rt.block_on(async {
                    let chunker = Chunker::new(Arc::new(MemoryStore::new()), chunk_size).unwrap();
                    chunker.chunk_bytes(black_box(data)).await.unwrap()
                })
            })
        });
    }

    let chunker = Chunker::new(Arc::new(MemoryStore::new()), 256 * 1024).unwrap();
    let manifest = rt.block_on(chunker.chunk_bytes(&data)).unwrap();
    group.bench_function("read_64KB_window", |b| {
        b.iter(|| {
            rt.block_on(async {
                chunker
                    .read(&manifest, black_box(3_000_000), 64 * 1024)
                    .await
                    .unwrap()
            })
        })
    });

    group.finish();
}

criterion_group!(benches, bench_inserts, bench_reads, bench_chunker);
criterion_main!(benches);
