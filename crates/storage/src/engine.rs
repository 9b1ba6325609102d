//! Shard store: one WAL + series index per shard.
//!
//! Layout on disk is `<root>/<database>/<policy>/<shard_id>/wal.log`. Every
//! write batch goes to the shard's WAL first and then into its index.

use crate::mapper::{LocalMapper, Mapper};
use crate::series::SeriesIndex;
use crate::store::{DataStore, StoreError};
use crate::wal::{FsyncPolicy, Wal};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_common::{Point, ShardId};
use tokio::sync::RwLock;

const WAL_FILE: &str = "wal.log";

#[derive(Debug)]
struct Shard {
    wal: Wal<Vec<Point>>,
    index: SeriesIndex,
}

impl Shard {
    fn open(dir: &Path, fsync: FsyncPolicy) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let wal_path = dir.join(WAL_FILE);

        let mut index = SeriesIndex::new();
        for batch in Wal::<Vec<Point>>::replay(&wal_path)? {
            for point in &batch {
                index.insert(point);
            }
        }
        let wal = Wal::open(&wal_path, fsync)?;
        Ok(Self { wal, index })
    }
}

/// All shards hosted by this node.
#[derive(Debug)]
pub struct ShardStore {
    root: PathBuf,
    fsync: FsyncPolicy,
    shards: RwLock<HashMap<ShardId, Arc<RwLock<Shard>>>>,
}

impl ShardStore {
    /// Open the store at `root`, replaying every shard found on disk.
    pub fn open(root: &Path, fsync: FsyncPolicy) -> Result<Self, StoreError> {
        std::fs::create_dir_all(root)?;

        let mut shards = HashMap::new();
        for db in read_dirs(root)? {
            for rp in read_dirs(&db)? {
                for shard_dir in read_dirs(&rp)? {
                    let Some(id) = shard_dir
                        .file_name()
                        .and_then(|n| n.to_str())
                        .and_then(|n| n.parse::<ShardId>().ok())
                    else {
                        continue;
                    };
                    let shard = Shard::open(&shard_dir, fsync)?;
                    tracing::debug!(
                        shard_id = id,
                        points = shard.index.point_count(),
                        "shard recovered from WAL"
                    );
                    shards.insert(id, Arc::new(RwLock::new(shard)));
                }
            }
        }

        tracing::info!(
            "shard store opened: {} shard(s) recovered at {:?}",
            shards.len(),
            root
        );

        Ok(Self {
            root: root.to_path_buf(),
            fsync,
            shards: RwLock::new(shards),
        })
    }

    async fn shard(&self, id: ShardId) -> Result<Arc<RwLock<Shard>>, StoreError> {
        self.shards
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::ShardNotFound(id))
    }

    /// IDs of all shards on this node, ascending.
    pub async fn shard_ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<ShardId> = self.shards.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Distinct (series, time) entries stored in a shard.
    pub async fn point_count(&self, id: ShardId) -> Option<usize> {
        let shard = self.shard(id).await.ok()?;
        let count = shard.read().await.index.point_count();
        Some(count)
    }

    /// Fsync every shard WAL (for batch mode).
    pub async fn sync_all(&self) -> Result<(), StoreError> {
        let shards: Vec<_> = self.shards.read().await.values().cloned().collect();
        for shard in shards {
            shard.write().await.wal.sync()?;
        }
        Ok(())
    }
}

#[async_trait]
impl DataStore for ShardStore {
    async fn create_shard(
        &self,
        database: &str,
        policy: &str,
        shard_id: ShardId,
    ) -> Result<(), StoreError> {
        let mut shards = self.shards.write().await;
        if shards.contains_key(&shard_id) {
            return Ok(());
        }
        let dir = self
            .root
            .join(database)
            .join(policy)
            .join(shard_id.to_string());
        let shard = Shard::open(&dir, self.fsync)?;
        shards.insert(shard_id, Arc::new(RwLock::new(shard)));
        tracing::info!(shard_id, database, policy, "shard created");
        Ok(())
    }

    async fn write_to_shard(&self, shard_id: ShardId, points: &[Point]) -> Result<(), StoreError> {
        let shard = self.shard(shard_id).await?;
        let mut shard = shard.write().await;
        shard.wal.append(&points.to_vec())?;
        for point in points {
            shard.index.insert(point);
        }
        Ok(())
    }

    async fn create_mapper(
        &self,
        shard_id: ShardId,
        query: &str,
        chunk_size: usize,
    ) -> Result<Box<dyn Mapper>, StoreError> {
        let shard = self.shard(shard_id).await?;
        let shard = shard.read().await;
        let series = shard.index.select(query.trim()).cloned().collect();
        Ok(Box::new(LocalMapper::new(series, chunk_size)))
    }
}

fn read_dirs(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::FieldValue;
    use tempfile::TempDir;

    fn point(host: &str, time: i64) -> Point {
        Point::new("cpu", time)
            .with_tag("host", host)
            .with_field("value", FieldValue::Float(1.0))
    }

    #[tokio::test]
    async fn test_write_to_unknown_shard() {
        let dir = TempDir::new().unwrap();
        let store = ShardStore::open(dir.path(), FsyncPolicy::None).unwrap();
        let err = store.write_to_shard(7, &[point("a", 1)]).await.unwrap_err();
        assert!(matches!(err, StoreError::ShardNotFound(7)));
    }

    #[tokio::test]
    async fn test_create_write_and_count() {
        let dir = TempDir::new().unwrap();
        let store = ShardStore::open(dir.path(), FsyncPolicy::None).unwrap();
        store.create_shard("db0", "rp0", 1).await.unwrap();
        // Creating twice is a no-op.
        store.create_shard("db0", "rp0", 1).await.unwrap();

        store
            .write_to_shard(1, &[point("a", 1), point("b", 1), point("a", 2)])
            .await
            .unwrap();
        assert_eq!(store.point_count(1).await, Some(3));
        assert_eq!(store.point_count(2).await, None);
        assert!(dir.path().join("db0/rp0/1/wal.log").exists());
    }

    #[tokio::test]
    async fn test_reopen_recovers_shards() {
        let dir = TempDir::new().unwrap();
        {
            let store = ShardStore::open(dir.path(), FsyncPolicy::Always).unwrap();
            store.create_shard("db0", "rp0", 1).await.unwrap();
            store.create_shard("db1", "rp9", 4).await.unwrap();
            store.write_to_shard(1, &[point("a", 1)]).await.unwrap();
            store
                .write_to_shard(4, &[point("a", 1), point("a", 2)])
                .await
                .unwrap();
        }

        let store = ShardStore::open(dir.path(), FsyncPolicy::Always).unwrap();
        assert_eq!(store.shard_ids().await, vec![1, 4]);
        assert_eq!(store.point_count(1).await, Some(1));
        assert_eq!(store.point_count(4).await, Some(2));
    }

    #[tokio::test]
    async fn test_create_mapper_reads_shard() {
        let dir = TempDir::new().unwrap();
        let store = ShardStore::open(dir.path(), FsyncPolicy::None).unwrap();
        store.create_shard("db0", "rp0", 1).await.unwrap();
        store
            .write_to_shard(1, &[point("a", 2), point("a", 1), point("b", 5)])
            .await
            .unwrap();

        let mut mapper = store.create_mapper(1, "cpu", 0).await.unwrap();
        mapper.open().await.unwrap();
        let first = mapper.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.tags["host"], "a");
        let times: Vec<i64> = first.values.iter().map(|v| v.time).collect();
        assert_eq!(times, vec![1, 2]);
        assert!(mapper.next_chunk().await.unwrap().is_some());
        assert!(mapper.next_chunk().await.unwrap().is_none());
        mapper.close().await;

        assert!(matches!(
            store.create_mapper(9, "", 0).await,
            Err(StoreError::ShardNotFound(9))
        ));
    }

    #[tokio::test]
    async fn test_sync_all() {
        let dir = TempDir::new().unwrap();
        let store = ShardStore::open(dir.path(), FsyncPolicy::Batch).unwrap();
        store.create_shard("db0", "rp0", 1).await.unwrap();
        store.write_to_shard(1, &[point("a", 1)]).await.unwrap();
        store.sync_all().await.unwrap();
    }
}
