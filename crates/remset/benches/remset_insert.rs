//! Benchmark for remembered-set inserts.
//!
//! Measures the cost of `add_reference` on each representation: sparse
//! lists, fine bitmaps, and sources already coarsened.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use remset::remset::RemSetGeometry;
use remset::{CardIdx, RegionIdx, RememberedSet};

const CARDS_PER_REGION: usize = 2048;

fn geometry() -> RemSetGeometry {
    RemSetGeometry {
        cards_per_region: CARDS_PER_REGION,
        n_regions: 256,
        sparse_entries_per_source: 4,
        max_fine_entries: 16,
        eviction_sample_size: 4,
    }
}

fn card(source: usize, offset: usize) -> CardIdx {
    CardIdx(source * CARDS_PER_REGION + offset % CARDS_PER_REGION)
}

fn benchmark_inserts(c: &mut Criterion) {
    let mut group = c.benchmark_group("remset_insert");
    group.sample_size(20);

    // Few cards per source: everything stays sparse.
    group.bench_function("sparse_64_sources", |b| {
        b.iter_batched(
            || RememberedSet::new(RegionIdx(0), geometry()),
            |rs| {
                for source in 1..65 {
                    for i in 0..3 {
                        rs.add_reference(RegionIdx(source), card(source, i * 97));
                    }
                }
                std::hint::black_box(rs.occupied())
            },
            BatchSize::SmallInput,
        );
    });

    // Many cards from a handful of sources: fine tables.
    group.bench_function("fine_8_sources", |b| {
        b.iter_batched(
            || RememberedSet::new(RegionIdx(0), geometry()),
            |rs| {
                for source in 1..9 {
                    for i in 0..512 {
                        rs.add_reference(RegionIdx(source), card(source, i * 3));
                    }
                }
                std::hint::black_box(rs.occupied())
            },
            BatchSize::SmallInput,
        );
    });

    // More dense sources than fine tables: coarsening, then coarse hits.
    group.bench_function("coarsening_64_sources", |b| {
        b.iter_batched(
            || RememberedSet::new(RegionIdx(0), geometry()),
            |rs| {
                for source in 1..65 {
                    for i in 0..32 {
                        rs.add_reference(RegionIdx(source), card(source, i * 31));
                    }
                }
                std::hint::black_box(rs.coarse_sources())
            },
            BatchSize::SmallInput,
        );
    });

    // Repeated inserts of cards that are already present.
    let warm = RememberedSet::new(RegionIdx(0), geometry());
    for source in 1..33 {
        for i in 0..64 {
            warm.add_reference(RegionIdx(source), card(source, i));
        }
    }
    group.bench_function("duplicate_inserts", |b| {
        b.iter(|| {
            for source in 1..33 {
                for i in 0..64 {
                    std::hint::black_box(warm.add_reference(RegionIdx(source), card(source, i)));
                }
            }
        });
    });

    group.finish();
}

criterion_group!(benches, benchmark_inserts);
criterion_main!(benches);
