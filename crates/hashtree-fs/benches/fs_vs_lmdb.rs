//! Benchmark comparing FsBlobStore vs LmdbBlobStore performance
//!
//! Run with: cargo bench -p hashtree-fs

use hashtree_core::store::Store;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Mix of node-sized and chunk-sized blobs
fn generate_blobs() -> Vec<Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(3);
    (0..2000)
        .map(|i| {
            let len: usize = if i % 50 == 0 {
                rng.gen_range(256 * 1024..2 * 1024 * 1024)
            } else {
                rng.gen_range(64..8 * 1024)
            };
            (0..len).map(|_| rng.gen()).collect()
        })
        .collect()
}

fn format_duration(d: Duration) -> String {
    if d.as_secs() > 0 {
        format!("{:.2}s", d.as_secs_f64())
    } else if d.as_millis() > 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}µs", d.as_micros())
    }
}

fn format_throughput(bytes: usize, duration: Duration) -> String {
    let mb = bytes as f64 / (1024.0 * 1024.0);
    let secs = duration.as_secs_f64();
    if secs > 0.0 {
        format!("{:.1} MB/s", mb / secs)
    } else {
        "∞".to_string()
    }
}

async fn benchmark_store<S: Store>(store: &S, blobs: &[Vec<u8>], name: &str) -> (Duration, Duration) {
    let total_bytes: usize = blobs.iter().map(|b| b.len()).sum();
    let mut hashes = Vec::with_capacity(blobs.len());

    let write_start = Instant::now();
    for data in blobs {
        hashes.push(store.put(data.clone()).await.unwrap());
    }
    let write_duration = write_start.elapsed();

    let read_start = Instant::now();
    for hash in &hashes {
        let _ = store.get(hash).await.unwrap();
    }
    let read_duration = read_start.elapsed();

    // 4KB windows out of the large blobs, as a chunked video read would
    let range_start = Instant::now();
    for (hash, data) in hashes.iter().zip(blobs).filter(|(_, d)| d.len() > 64 * 1024) {
        let mid = data.len() as u64 / 2;
        let _ = store.get_range(hash, mid, mid + 4096).await.unwrap();
    }
    let range_duration = range_start.elapsed();

    println!("\n{}:", name);
    println!("  Blobs: {}", blobs.len());
    println!("  Total size: {:.2} MB", total_bytes as f64 / (1024.0 * 1024.0));
    println!("  Write: {} ({})", format_duration(write_duration), format_throughput(total_bytes, write_duration));
    println!("  Read:  {} ({})", format_duration(read_duration), format_throughput(total_bytes, read_duration));
    println!("  Range: {}", format_duration(range_duration));

    (write_duration, read_duration)
}

#[tokio::main]
async fn main() {
    println!("=== Hashtree Storage Backend Benchmark ===");

    let blobs = generate_blobs();

    let fs_temp = TempDir::new().unwrap();
    let lmdb_temp = TempDir::new().unwrap();

    let fs_store = hashtree_fs::FsBlobStore::new(fs_temp.path().join("blobs")).unwrap();
    let (fs_write, fs_read) = benchmark_store(&fs_store, &blobs, "FsBlobStore (filesystem)").await;

    let lmdb_store = hashtree_lmdb::LmdbBlobStore::new(lmdb_temp.path().join("blobs")).unwrap();
    let (lmdb_write, lmdb_read) = benchmark_store(&lmdb_store, &blobs, "LmdbBlobStore").await;

    println!("\n=== Summary ===");
    println!("Write speedup: {:.2}x (FS {} vs LMDB {})",
        lmdb_write.as_secs_f64() / fs_write.as_secs_f64().max(0.001),
        format_duration(fs_write),
        format_duration(lmdb_write));
    println!("Read speedup:  {:.2}x (FS {} vs LMDB {})",
        lmdb_read.as_secs_f64() / fs_read.as_secs_f64().max(0.001),
        format_duration(fs_read),
        format_duration(lmdb_read));

    // Existence checks dominate fallback reads
    let hashes: Vec<_> = blobs.iter().map(|data| hashtree_core::sha256(data)).collect();
    let iterations = 10_000;

    let start = Instant::now();
    for i in 0..iterations {
        let _ = fs_store.has(&hashes[i % hashes.len()]).await.unwrap();
    }
    let fs_has = start.elapsed();

    let start = Instant::now();
    for i in 0..iterations {
        let _ = lmdb_store.has(&hashes[i % hashes.len()]).await.unwrap();
    }
    let lmdb_has = start.elapsed();

    println!("\n=== Existence checks ({} calls) ===", iterations);
    println!("FS:   {} ({:.0} ops/sec)", format_duration(fs_has), iterations as f64 / fs_has.as_secs_f64());
    println!("LMDB: {} ({:.0} ops/sec)", format_duration(lmdb_has), iterations as f64 / lmdb_has.as_secs_f64());
}
