//! The local data store capability used by the write coordinator, the shard
//! service and the query router.

use crate::mapper::Mapper;
use crate::wal::WalError;
use async_trait::async_trait;
use strata_common::{Point, ShardId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The shard has not been created on this node.
    #[error("shard not found: {0}")]
    ShardNotFound(ShardId),
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait DataStore: Send + Sync {
    /// Create the shard if it does not exist yet.
    async fn create_shard(
        &self,
        database: &str,
        policy: &str,
        shard_id: ShardId,
    ) -> Result<(), StoreError>;

    /// Persist points into an existing shard.
    async fn write_to_shard(&self, shard_id: ShardId, points: &[Point]) -> Result<(), StoreError>;

    /// Build an unopened mapper over a shard.
    async fn create_mapper(
        &self,
        shard_id: ShardId,
        query: &str,
        chunk_size: usize,
    ) -> Result<Box<dyn Mapper>, StoreError>;
}
