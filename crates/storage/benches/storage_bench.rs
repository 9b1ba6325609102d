//! Benchmarks for the shard store (WAL + series index).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use strata_common::{FieldValue, Point};
use strata_storage::{DataStore, FsyncPolicy, ShardStore};
use tempfile::TempDir;

fn make_batch(batch: usize, offset: i64) -> Vec<Point> {
    (0..batch)
        .map(|i| {
            Point::new("cpu", offset + i as i64)
                .with_tag("host", format!("host{}", i % 16))
                .with_field("value", FieldValue::Float(i as f64))
        })
        .collect()
}

fn bench_write_to_shard(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("write_to_shard");

    for batch in [1, 100, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            let dir = TempDir::new().unwrap();
            let store = ShardStore::open(dir.path(), FsyncPolicy::None).unwrap();
            rt.block_on(store.create_shard("db", "rp", 1)).unwrap();

            let mut offset = 0i64;
            b.iter(|| {
                let points = make_batch(batch, offset);
                rt.block_on(store.write_to_shard(1, black_box(&points)))
                    .unwrap();
                offset += batch as i64;
            });
        });
    }
    group.finish();
}

fn bench_map_shard(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = TempDir::new().unwrap();
    let store = ShardStore::open(dir.path(), FsyncPolicy::None).unwrap();
    rt.block_on(async {
        store.create_shard("db", "rp", 1).await.unwrap();
        for i in 0..10 {
            store
                .write_to_shard(1, &make_batch(1000, i * 1000))
                .await
                .unwrap();
        }
    });

    c.bench_function("map_shard_10k", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut mapper = store.create_mapper(1, "cpu", 100).await.unwrap();
                mapper.open().await.unwrap();
                let mut chunks = 0usize;
                while let Some(chunk) = mapper.next_chunk().await.unwrap() {
                    chunks += black_box(chunk).values.len();
                }
                mapper.close().await;
                chunks
            })
        });
    });
}

criterion_group!(benches, bench_write_to_shard, bench_map_shard);
criterion_main!(benches);
