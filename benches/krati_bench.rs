use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use krati_core::{Store, StoreConfig};
use std::fs::remove_dir_all;

fn setup_bench_dir(path: &str) {
    let _ = remove_dir_all(path);
    std::fs::create_dir_all(path).unwrap();
}

fn bench_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("set_operations");

    for size in [10u64, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let test_dir = format!("bench_data/set_{}", size);
            setup_bench_dir(&test_dir);
            let mut store = Store::open(StoreConfig::new(&test_dir, size.max(1))).unwrap();

            b.iter(|| {
                for i in 0..size {
                    let value = format!("value_{}", i);
                    store.set(i, value.as_bytes(), i + 1).unwrap();
                }
            });

            let _ = remove_dir_all(&test_dir);
        });
    }
    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let test_dir = "bench_data/get";
    setup_bench_dir(test_dir);
    let mut store = Store::open(StoreConfig::new(test_dir, 1000)).unwrap();

    // Pre-populate with data
    for i in 0..1000u64 {
        let value = format!("value_{}", i);
        store.set(i, value.as_bytes(), i + 1).unwrap();
    }
    store.sync().unwrap();

    c.bench_function("get_existing_index", |b| {
        b.iter(|| {
            let result = store.get(black_box(500)).unwrap();
            black_box(result);
        });
    });

    let _ = remove_dir_all(test_dir);
}

fn bench_compaction(c: &mut Criterion) {
    c.bench_function("compact_1000_indices", |b| {
        b.iter_with_setup(
            || {
                let test_dir = "bench_data/compact";
                setup_bench_dir(test_dir);
                let mut config = StoreConfig::new(test_dir, 1000);
                config.segment_file_size_mb = 1;
                let mut store = Store::open(config).unwrap();

                // Write the same indices multiple times so most of the
                // earlier segments end up with a low live ratio.
                let mut scn = 0u64;
                for round in 0..5 {
                    for i in 0..1000u64 {
                        scn += 1;
                        let value = format!("value_{}_{}", i, round);
                        store.set(i, value.as_bytes(), scn).unwrap();
                    }
                }
                store.sync().unwrap();
                store
            },
            |mut store| {
                store.compact().unwrap();
            },
        );
    });
}

criterion_group!(benches, bench_set, bench_get, bench_compaction);
criterion_main!(benches);
