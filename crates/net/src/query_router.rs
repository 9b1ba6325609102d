//! Routes shard queries to a local or remote mapper.

use crate::pool::PoolRegistry;
use crate::remote_mapper::RemoteMapper;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use strata_common::NodeId;
use strata_meta::ShardInfo;
use strata_storage::{DataStore, Mapper, MapperError, StoreError};

/// Chooses which owner of a shard serves a remote query.
pub trait OwnerSelector: Send + Sync {
    /// Pick one of `owners`, or `None` if it is empty.
    fn select(&self, owners: &[NodeId]) -> Option<NodeId>;
}

/// Uniformly random owner.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomOwner;

impl OwnerSelector for RandomOwner {
    fn select(&self, owners: &[NodeId]) -> Option<NodeId> {
        if owners.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..owners.len());
        Some(owners[idx])
    }
}

/// Cycles through owners across calls.
#[derive(Debug, Default)]
pub struct RoundRobinOwner {
    next: AtomicUsize,
}

impl OwnerSelector for RoundRobinOwner {
    fn select(&self, owners: &[NodeId]) -> Option<NodeId> {
        if owners.is_empty() {
            return None;
        }
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        Some(owners[n % owners.len()])
    }
}

pub struct QueryRouter {
    node_id: NodeId,
    store: Arc<dyn DataStore>,
    pools: Arc<PoolRegistry>,
    selector: Box<dyn OwnerSelector>,
    force_remote: bool,
}

impl std::fmt::Debug for QueryRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRouter")
            .field("node_id", &self.node_id)
            .field("force_remote", &self.force_remote)
            .finish_non_exhaustive()
    }
}

impl QueryRouter {
    pub fn new(node_id: NodeId, store: Arc<dyn DataStore>, pools: Arc<PoolRegistry>) -> Self {
        Self {
            node_id,
            store,
            pools,
            selector: Box::new(RandomOwner),
            force_remote: false,
        }
    }

    pub fn with_selector(mut self, selector: Box<dyn OwnerSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Always query a remote owner, even when this node owns the shard.
    pub fn with_force_remote(mut self, force_remote: bool) -> Self {
        self.force_remote = force_remote;
        self
    }

    /// Build an unopened mapper for `shard`.
    pub async fn create_mapper(
        &self,
        shard: &ShardInfo,
        query: &str,
        chunk_size: usize,
    ) -> Result<Box<dyn Mapper>, MapperError> {
        if shard.owned_by(self.node_id) && !self.force_remote {
            return self
                .store
                .create_mapper(shard.id, query, chunk_size)
                .await
                .map_err(|e| match e {
                    StoreError::ShardNotFound(id) => MapperError::ShardNotFound(id),
                    other => MapperError::Transport(other.to_string()),
                });
        }

        let owner = self
            .selector
            .select(&shard.owner_ids)
            .ok_or(MapperError::ShardNotFound(shard.id))?;
        tracing::debug!(shard_id = shard.id, owner, "routing shard query to remote owner");
        let conn = self.pools.dial(owner).await?;
        Ok(Box::new(RemoteMapper::new(conn, shard.id, query, chunk_size)))
    }
}
