//! Allocator benchmarks.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use tieralloc_core::host::RoundRobinHost;
use tieralloc_core::{AllocState, Heap, RegionLayout};

fn bench_state() -> AllocState {
    AllocState::new(
        RegionLayout::with_tracked_span(16 << 30),
        Arc::new(RoundRobinHost::new(0)),
    )
    .expect("bench layout is valid")
}

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096, 16_320, 32_768, 1 << 20];
    let mut group = c.benchmark_group("alloc_free_cycle");

    let state = bench_state();
    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("tieralloc", size), &size, |b, &sz| {
            let heap = Heap::new(&state);
            b.iter(|| {
                let p = heap.alloc(sz).unwrap();
                heap.free(criterion::black_box(p));
            });
        });
    }
    group.finish();
}

fn bench_alloc_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_burst");

    let state = bench_state();
    group.bench_function("1000x64B", |b| {
        let heap = Heap::new(&state);
        let mut chunks = Vec::with_capacity(1000);
        b.iter(|| {
            for _ in 0..1000 {
                chunks.push(heap.alloc(64).unwrap());
            }
            for p in chunks.drain(..) {
                heap.free(p);
            }
        });
    });

    group.finish();
}

fn bench_mixed_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("mixed_churn");

    let state = bench_state();
    group.bench_function("xorshift_sizes", |b| {
        let heap = Heap::new(&state);
        let mut rng = 0x2545_F491_4F6C_DD1Du64;
        let mut live: Vec<usize> = Vec::with_capacity(256);
        b.iter(|| {
            rng ^= rng >> 12;
            rng ^= rng << 25;
            rng ^= rng >> 27;
            if live.len() < 256 && rng % 2 == 0 {
                let size = 1 + (rng as usize >> 8) % 20_000;
                live.push(heap.alloc(size).unwrap());
            } else if let Some(p) = live.pop() {
                heap.free(p);
            }
        });
        for p in live.drain(..) {
            heap.free(p);
        }
    });

    group.finish();
}

criterion_group!(benches, bench_alloc_free_cycle, bench_alloc_burst, bench_mixed_churn);
criterion_main!(benches);
