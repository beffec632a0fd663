//! Benchmark for the pause-time remembered-set scan.
//!
//! Builds an old generation with references into a set of young regions,
//! then times prepare, scan and cleanup over the young regions.

use std::sync::atomic::{AtomicUsize, Ordering};

use criterion::{criterion_group, criterion_main, Criterion};
use remset::{Address, RefWidth, RegionIdx, RegionKind, RemSetConfig, RemSetContext, WorkGang};

struct Heap {
    ctx: RemSetContext,
    young: Vec<RegionIdx>,
}

fn build_heap(old_regions: usize, young_regions: usize) -> Heap {
    let mut config = RemSetConfig::new(20, old_regions + young_regions);
    config.set_refinement_threads(0);
    config.set_parallel_workers(4);
    let ctx = RemSetContext::new(config).expect("heap reservation");

    let young: Vec<RegionIdx> = (0..young_regions)
        .map(|_| ctx.allocate_region(RegionKind::Young).expect("young region"))
        .collect();
    let targets: Vec<Address> = young
        .iter()
        .flat_map(|&r| (0..64).map(move |_| r))
        .map(|r| ctx.heap().allocate(r, 0, RefWidth::Wide).expect("target"))
        .collect();

    let queue = ctx.new_mutator_queue();
    let mut x: u64 = 0x2545_f491_4f6c_dd1d;
    for _ in 0..old_regions {
        let region = ctx.allocate_region(RegionKind::Old).expect("old region");
        while let Some(obj) = ctx.heap().allocate(region, 8, RefWidth::Narrow) {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            if x % 4 == 0 {
                let target = targets[(x >> 8) as usize % targets.len()];
                ctx.write_ref(&queue, obj, (x >> 32) as usize % 8, Some(target));
            }
        }
    }
    drop(queue);
    ctx.refine_pending_buffers();
    Heap { ctx, young }
}

fn benchmark_pause_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("pause_scan");
    group.sample_size(10);
    group.warm_up_time(std::time::Duration::from_millis(500));

    let gang = WorkGang::new("bench-pause", 4).expect("gang");
    for (old, young) in [(16, 4), (64, 8)] {
        let heap = build_heap(old, young);
        let ctx = &heap.ctx;
        group.bench_function(format!("old_{old}_young_{young}"), |b| {
            b.iter(|| {
                let found = AtomicUsize::new(0);
                ctx.enter_safepoint();
                ctx.prepare_for_scan(&heap.young);
                let summary = ctx.oops_into_collection_set_do(&gang, &|_w: usize, _s: Address, _r: Address| {
                    found.fetch_add(1, Ordering::Relaxed);
                });
                ctx.cleanup_after_scan();
                ctx.leave_safepoint();
                std::hint::black_box((summary, found.into_inner()))
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_pause_scan);
criterion_main!(benches);
