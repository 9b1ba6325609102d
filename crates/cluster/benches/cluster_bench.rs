//! Benchmarks for write coordination: shard mapping and local point writes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::Duration;
use strata_cluster::{map_shards, PointsWriter, ShardWriter, WritePointsRequest, WriteShardError};
use strata_common::{FieldValue, NodeId, Point, ShardId, HOUR_NANOS};
use strata_meta::{LocalMetaStore, RetentionPolicySpec};
use strata_storage::{FsyncPolicy, ShardStore};
use tempfile::TempDir;

struct NoopWriter;

#[async_trait::async_trait]
impl ShardWriter for NoopWriter {
    async fn write_shard(&self, _: ShardId, _: NodeId, _: &[Point]) -> Result<(), WriteShardError> {
        Ok(())
    }
}

async fn make_meta(nodes: usize) -> LocalMetaStore {
    let meta = LocalMetaStore::new(1);
    for i in 0..nodes {
        meta.create_node(&format!("node{}:8088", i)).await.unwrap();
    }
    meta.create_database("db").await.unwrap();
    meta.create_retention_policy(
        "db",
        &RetentionPolicySpec {
            name: "rp".into(),
            duration: Duration::ZERO,
            replica_n: 1,
        },
    )
    .await
    .unwrap();
    meta
}

/// `batch` points over 64 series, spread across `hours` hours.
fn make_request(batch: usize, hours: i64) -> WritePointsRequest {
    let mut req = WritePointsRequest::new("db", "rp");
    for i in 0..batch {
        let time = (i as i64 % hours.max(1)) * HOUR_NANOS + i as i64;
        req.add_point(
            Point::new("cpu", time)
                .with_tag("host", format!("host{}", i % 64))
                .with_field("value", FieldValue::Float(i as f64)),
        );
    }
    req
}

fn bench_map_shards(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("map_shards");

    for nodes in [1, 4, 16] {
        let meta = rt.block_on(make_meta(nodes));
        let request = make_request(1000, 1);
        // Create the shard group outside the measured loop.
        rt.block_on(map_shards(&meta, &request)).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(nodes), &nodes, |b, _| {
            b.iter(|| {
                let mapping = rt.block_on(map_shards(&meta, black_box(&request))).unwrap();
                black_box(mapping)
            });
        });
    }
    group.finish();
}

fn bench_write_points_local(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("write_points_local");

    for batch in [10, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            let dir = TempDir::new().unwrap();
            let store = Arc::new(ShardStore::open(dir.path(), FsyncPolicy::None).unwrap());
            let meta = Arc::new(rt.block_on(make_meta(1)));
            let writer =
                PointsWriter::new(meta, store, Arc::new(NoopWriter), Duration::from_secs(5));
            let request = make_request(batch, 1);

            b.iter(|| {
                rt.block_on(writer.write_points(black_box(request.clone())))
                    .unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_map_shards, bench_write_points_local);
criterion_main!(benches);
