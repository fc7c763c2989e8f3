//! Backend throughput benchmarks on SQLite
//!
//! Measures single-threaded put/get latency through the full facade
//! (transaction, retry wrapper, event insert) and range reads.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use relkv_core::{Config, Context, Item};
use relkv_engine::{Backend, EventBuffer};
use relkv_sqlite::{SqliteConfig, SqliteDriver};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn open_backend(temp_dir: &TempDir) -> Backend<SqliteDriver> {
    let backend_cfg = Config {
        poll_stream_period: Duration::from_millis(100),
        ..Config::default()
    };
    let driver = SqliteDriver::new(
        SqliteConfig::new(temp_dir.path().join("bench.db")).with_backend(backend_cfg),
    );
    Backend::new(
        driver,
        Arc::new(EventBuffer::new(4096)),
        &Context::background(),
    )
    .unwrap()
}

fn bench_put_get(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let backend = open_backend(&temp_dir);
    let ctx = Context::background();

    let mut group = c.benchmark_group("backend");
    group.throughput(Throughput::Elements(1));

    group.bench_function("put", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let item = Item::new(format!("key_{}", i), "value");
            black_box(backend.put(&ctx, item).unwrap());
            i += 1;
        });
    });

    backend.put(&ctx, Item::new("hot", "value")).unwrap();
    group.bench_function("get", |b| {
        b.iter(|| black_box(backend.get(&ctx, b"hot").unwrap()));
    });

    group.finish();
    backend.close().unwrap();
}

fn bench_range(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let backend = open_backend(&temp_dir);
    let ctx = Context::background();
    for i in 0..1000 {
        backend
            .put(&ctx, Item::new(format!("range_{:04}", i), "value"))
            .unwrap();
    }

    let mut group = c.benchmark_group("range");
    for limit in [10usize, 100, 1000] {
        group.throughput(Throughput::Elements(limit as u64));
        group.bench_with_input(BenchmarkId::from_parameter(limit), &limit, |b, &limit| {
            b.iter(|| {
                black_box(
                    backend
                        .get_range(&ctx, b"range_", b"range_~", limit)
                        .unwrap(),
                )
            });
        });
    }
    group.finish();
    backend.close().unwrap();
}

criterion_group!(benches, bench_put_get, bench_range);
criterion_main!(benches);
