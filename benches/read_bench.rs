// Read performance benchmarks for drhdb

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use drhdb::{Options, DB};
use std::hint::black_box;
use tempfile::TempDir;

fn populated(temp_dir: &TempDir, size: usize, opts: Options) -> DB {
    let db = DB::open(temp_dir.path(), opts).unwrap();
    for i in 0..size {
        let key = format!("key{:08}", i);
        let value = format!("value{:08}", i);
        db.set(key.as_bytes(), value.as_bytes()).unwrap();
    }
    db.sync().unwrap();
    db
}

fn bench_options() -> Options {
    Options::default().partition_count(16_384).auto_sync(false)
}

fn benchmark_sequential_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential_read");

    for size in [100, 1000, 10000].iter() {
        let temp_dir = TempDir::new().unwrap();
        let db = populated(&temp_dir, *size, bench_options().value_cache_ttl(None));

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                for i in 0..size {
                    let key = format!("key{:08}", i);
                    let value = db.get(key.as_bytes()).unwrap();
                    black_box(value);
                }
            });
        });
    }

    group.finish();
}

fn benchmark_random_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("random_read");

    for size in [100, 1000, 10000].iter() {
        let temp_dir = TempDir::new().unwrap();
        let db = populated(&temp_dir, *size, bench_options().value_cache_ttl(None));

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                use rand::Rng;
                let mut rng = rand::rng();

                for _ in 0..size {
                    let key_num: usize = rng.random_range(0..size);
                    let key = format!("key{:08}", key_num);
                    let value = db.get(key.as_bytes()).unwrap();
                    black_box(value);
                }
            });
        });
    }

    group.finish();
}

fn benchmark_cache_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_hit");

    let temp_dir = TempDir::new().unwrap();
    let db = populated(&temp_dir, 1000, bench_options());

    // Warm up cache by reading all keys once
    for i in 0..1000 {
        let key = format!("key{:08}", i);
        let _ = db.get(key.as_bytes()).unwrap();
    }

    group.throughput(Throughput::Elements(1000));
    group.bench_function("cached_reads", |b| {
        b.iter(|| {
            for i in 0..1000 {
                let key = format!("key{:08}", i);
                let value = db.get(key.as_bytes()).unwrap();
                black_box(value);
            }
        });
    });

    group.finish();
}

fn benchmark_read_missing_keys(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_missing");

    let temp_dir = TempDir::new().unwrap();
    let db = populated(&temp_dir, 1000, bench_options());

    group.throughput(Throughput::Elements(1000));
    group.bench_function("missing_keys", |b| {
        b.iter(|| {
            // Keys 1000-1999 were never written
            for i in 1000..2000 {
                let key = format!("key{:08}", i);
                let value = db.get(key.as_bytes()).unwrap();
                black_box(value);
            }
        });
    });

    group.finish();
}

fn benchmark_read_split_table(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_split_table");

    // Lookups walk one or more sub-indexes before reaching a list.
    for max_items in [16u32, 256].iter() {
        let temp_dir = TempDir::new().unwrap();
        let opts = Options::default()
            .partition_count(1)
            .max_meta_list_items(*max_items)
            .auto_sync(false)
            .value_cache_ttl(None);
        let db = populated(&temp_dir, 5000, opts);

        group.throughput(Throughput::Elements(5000));
        group.bench_with_input(BenchmarkId::from_parameter(max_items), max_items, |b, _| {
            b.iter(|| {
                for i in 0..5000 {
                    let key = format!("key{:08}", i);
                    let value = db.get(key.as_bytes()).unwrap();
                    black_box(value);
                }
            });
        });
    }

    group.finish();
}

fn benchmark_items_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("items_scan");

    let temp_dir = TempDir::new().unwrap();
    let db = populated(&temp_dir, 10000, bench_options());

    group.throughput(Throughput::Elements(10000));
    group.bench_function("items_all", |b| {
        b.iter(|| {
            let items = db.items(None).unwrap();
            black_box(items);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_sequential_read,
    benchmark_random_read,
    benchmark_cache_hit,
    benchmark_read_missing_keys,
    benchmark_read_split_table,
    benchmark_items_scan
);
criterion_main!(benches);
