//! Store benchmarks for slotdb
//!
//! Measures the operations that dominate real workloads: ordered and
//! shuffled insertion, point search (cached and under pool pressure),
//! and full forward scans.
//!
//! ```bash
//! cargo bench --bench store
//! cargo bench --bench store -- insert   # insertion benchmarks only
//! cargo bench --bench store -- search   # point lookups only
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::tempdir;

use slotdb::Store;

const PAGE: usize = 4096;
const REC: usize = 200;
const KEY: usize = 20;

type BenchStore = Store<PAGE, REC, KEY, true>;

fn sample(id: usize) -> [u8; REC] {
    let mut record = [0u8; REC];
    let key = format!("{:020}", id);
    record[..KEY].copy_from_slice(key.as_bytes());
    for (i, byte) in record[KEY..].iter_mut().enumerate() {
        *byte = b'a' + ((id + i) % 26) as u8;
    }
    record
}

fn open_store(dir: &std::path::Path, pool: usize) -> BenchStore {
    BenchStore::open(dir.join("pages.bin"), dir.join("btree.bin"), pool).unwrap()
}

fn populated(count: usize, pool: usize) -> (tempfile::TempDir, BenchStore) {
    let dir = tempdir().unwrap();
    let mut store = open_store(dir.path(), pool);
    for id in 0..count {
        store.insert(&sample(id)).unwrap();
    }
    (dir, store)
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_insert");

    for count in [100usize, 1000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("sequential", count), &count, |b, &count| {
            b.iter_with_setup(
                || {
                    let dir = tempdir().unwrap();
                    let store = open_store(dir.path(), 64);
                    (dir, store)
                },
                |(_dir, mut store)| {
                    for id in 0..count {
                        store.insert(black_box(&sample(id))).unwrap();
                    }
                },
            );
        });
        group.bench_with_input(BenchmarkId::new("reversed", count), &count, |b, &count| {
            b.iter_with_setup(
                || {
                    let dir = tempdir().unwrap();
                    let store = open_store(dir.path(), 64);
                    (dir, store)
                },
                |(_dir, mut store)| {
                    for id in (0..count).rev() {
                        store.insert(black_box(&sample(id))).unwrap();
                    }
                },
            );
        });
    }

    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_search");

    let (_dir, store) = populated(1000, 64);
    group.bench_function("point_cached", |b| {
        let mut id = 0usize;
        b.iter(|| {
            id = (id + 617) % 1000;
            black_box(store.search(&sample(id)).unwrap()).is_some()
        });
    });

    let (_dir2, cold) = populated(1000, 2);
    group.bench_function("point_pool_pressure", |b| {
        let mut id = 0usize;
        b.iter(|| {
            id = (id + 617) % 1000;
            black_box(cold.search(&sample(id)).unwrap()).is_some()
        });
    });

    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_scan");

    for count in [1000usize] {
        let (_dir, store) = populated(count, 8);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_function(BenchmarkId::new("forward", count), |b| {
            b.iter(|| {
                let mut n = 0usize;
                for record in store.iter().unwrap() {
                    black_box(record.unwrap());
                    n += 1;
                }
                n
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_insert, bench_search, bench_scan);
criterion_main!(benches);
