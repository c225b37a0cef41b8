//! Benchmarks for content hashing and key generation.
//!
//! Benchmark targets:
//! - SHA-256 over a 1 MiB payload: <5ms
//! - Key generation: <10us

// Criterion macros generate items without docs - this is expected for benchmarks
#![allow(missing_docs)]

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::time::Duration;

use stowage::services::ContentHasher;
use stowage::storage::{generate_key, sanitize_filename};

// ============================================================================
// Hashing Benchmarks
// ============================================================================

const SIZES: &[usize] = &[1024, 64 * 1024, 1024 * 1024, 8 * 1024 * 1024];

fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

fn bench_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("content_hash");
    group.measurement_time(Duration::from_secs(5));

    for &size in SIZES {
        let data = payload(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| ContentHasher::hash(black_box(data)));
        });
    }

    group.finish();
}

// ============================================================================
// Key Generation Benchmarks
// ============================================================================

fn bench_keys(c: &mut Criterion) {
    let mut group = c.benchmark_group("keys");

    group.bench_function("generate_key", |b| {
        b.iter(|| generate_key(black_box("user-42"), black_box("Quarterly Report (final).pdf")));
    });

    group.bench_function("sanitize_long_name", |b| {
        let name = "résumé ".repeat(40);
        b.iter(|| sanitize_filename(black_box(&name)));
    });

    group.finish();
}

criterion_group!(benches, bench_hash, bench_keys);
criterion_main!(benches);
