//! Basic benchmarks for the `rdma_mempool` crate.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::time::Instant;

use alloc_tracker::Allocator;
use criterion::{Criterion, criterion_group, criterion_main};
use rdma_mempool::{MemDesc, Mempool};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

const SMALL: usize = 1500;
const LARGE: usize = 700_000;

fn entrypoint(c: &mut Criterion) {
    let allocs = alloc_tracker::Session::new();

    let mut group = c.benchmark_group("mempool_basic");

    let allocs_op = allocs.operation("build_default");
    group.bench_function("build_default", |b| {
        b.iter_custom(|iters| {
            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                drop(black_box(Mempool::new().unwrap()));
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("alloc_free_small");
    group.bench_function("alloc_free_small", |b| {
        b.iter_custom(|iters| {
            let pool = Mempool::new().unwrap();

            // Warm up the class so we measure reuse, not slab growth.
            let mut warm = pool.alloc(SMALL).unwrap();
            pool.free(&mut warm);

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                let mut block = pool.alloc(black_box(SMALL)).unwrap();
                pool.free(&mut block);
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("alloc_free_large");
    group.bench_function("alloc_free_large", |b| {
        b.iter_custom(|iters| {
            let pool = Mempool::new().unwrap();

            let mut warm = pool.alloc(LARGE).unwrap();
            pool.free(&mut warm);

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                let mut block = pool.alloc(black_box(LARGE)).unwrap();
                pool.free(&mut block);
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("alloc_free_gather_4");
    group.bench_function("alloc_free_gather_4", |b| {
        b.iter_custom(|iters| {
            let pool = Mempool::new().unwrap();
            let lengths = [SMALL, 20_000, 100_000, SMALL];
            let mut desc = MemDesc::new();

            pool.alloc_gather(&lengths, &mut desc).unwrap();
            pool.free_gather(&mut desc);

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                pool.alloc_gather(black_box(&lengths), &mut desc).unwrap();
                pool.free_gather(&mut desc);
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("gather_unwind");
    group.bench_function("gather_unwind", |b| {
        b.iter_custom(|iters| {
            let pool = Mempool::new().unwrap();
            let lengths = [SMALL, 20_000, 2_000_000];
            let mut desc = MemDesc::new();

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                _ = black_box(pool.alloc_gather(black_box(&lengths), &mut desc));
            }

            start.elapsed()
        });
    });

    group.finish();

    allocs.print_to_stdout();
}
