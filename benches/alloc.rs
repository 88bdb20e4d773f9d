// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 nvmalloc contributors
//
// Allocation-path benchmarks.
//
// Run with:
//   cargo bench --bench alloc
//
// Groups:
//   reserve_activate_free — full lifecycle through each size-class path
//   named_roundtrip       — the object-table layer on top of it
//
// Sizes cover the three dispatch paths:
//   small_64 — slab run slot
//   large_64k — 16-page block
//   huge_5m  — 3 whole chunks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use nvmalloc::Heap;

const SIZES: &[(&str, u64)] = &[
    ("small_64", 64),
    ("large_64k", 64 * 1024),
    ("huge_5m", 5 * 1024 * 1024),
];

fn bench_reserve_activate_free(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let heap = Heap::open(dir.path().join("ws"), false).unwrap();

    let mut group = c.benchmark_group("reserve_activate_free");
    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            b.iter(|| {
                let p = heap.reserve(sz).unwrap();
                unsafe {
                    heap.activate(p, None, None);
                    heap.free(black_box(p), None, None);
                }
            });
        });
    }
    group.finish();
}

fn bench_named_roundtrip(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let heap = Heap::open(dir.path().join("ws"), false).unwrap();

    let mut group = c.benchmark_group("named_roundtrip");
    for &(label, size) in &[("small_256", 256u64), ("large_16k", 16 * 1024)] {
        group.throughput(Throughput::Bytes(size));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            b.iter(|| {
                let p = heap.reserve_named("bench", sz).unwrap();
                unsafe { heap.activate(p, None, None) };
                heap.activate_named("bench");
                heap.free_named("bench");
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_reserve_activate_free, bench_named_roundtrip);
criterion_main!(benches);
