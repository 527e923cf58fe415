#![allow(missing_docs)]

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use trax_benchmark::{build_chain, build_fanout, create_bench_env};

#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn bench_fanout(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let mut group = c.benchmark_group("fanout_write_and_reconcile");
    for width in [16usize, 128, 512] {
        let trax = create_bench_env();
        let (_store, root) = build_fanout(&trax, width);
        let mut tick = 0i64;
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, &width| {
            b.iter(|| {
                tick += 1;
                for i in 0..width {
                    root.set(&format!("in{i}"), tick).expect("write");
                }
                runtime.block_on(trax.reconciliation()).expect("pass");
            });
        });
    }
    group.finish();
}

fn bench_chain(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let mut group = c.benchmark_group("chain_cascade");
    for depth in [8usize, 64, 256] {
        let trax = create_bench_env();
        let (_store, root) = build_chain(&trax, depth);
        let mut tick = 0i64;
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| {
                tick += 1;
                root.set("p0", tick).expect("write");
                runtime.block_on(trax.reconciliation()).expect("pass");
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fanout, bench_chain);
criterion_main!(benches);
