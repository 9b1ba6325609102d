//! The meta store capability and its in-process implementation.

use crate::data::{
    DatabaseInfo, MetaData, NodeInfo, RetentionPolicyInfo, RetentionPolicySpec,
    RetentionPolicyUpdate, ShardGroupInfo, UserInfo,
};
use crate::MetaError;
use async_trait::async_trait;
use std::sync::Arc;
use strata_common::{NodeId, ShardId};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Where a shard lives in the metadata tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardOwner {
    pub database: String,
    pub retention_policy: String,
    pub shard_group: ShardGroupInfo,
}

/// Metadata operations the write and query paths depend on.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// ID of the node this store runs on.
    fn node_id(&self) -> NodeId;

    async fn database(&self, name: &str) -> Option<DatabaseInfo>;

    /// Errors if the database is unknown; `Ok(None)` if only the policy is.
    async fn retention_policy(
        &self,
        database: &str,
        name: &str,
    ) -> Result<Option<RetentionPolicyInfo>, MetaError>;

    /// Return the live shard group covering `timestamp`, allocating it first
    /// if none exists.
    async fn create_shard_group_if_not_exists(
        &self,
        database: &str,
        policy: &str,
        timestamp: i64,
    ) -> Result<ShardGroupInfo, MetaError>;

    async fn shard_owner(&self, shard_id: ShardId) -> Option<ShardOwner>;

    async fn node(&self, id: NodeId) -> Option<NodeInfo>;
}

// ---------------------------------------------------------------------------
// LocalMetaStore
// ---------------------------------------------------------------------------

/// Copy-on-write meta store.
///
/// Readers grab the current `Arc<MetaData>` and never see a partial update.
/// Writers clone the snapshot under the write lock, mutate the clone, bump
/// its index and publish it.
pub struct LocalMetaStore {
    node_id: NodeId,
    data: RwLock<Arc<MetaData>>,
}

impl std::fmt::Debug for LocalMetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMetaStore")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

impl LocalMetaStore {
    pub fn new(node_id: NodeId) -> Self {
        Self::with_data(node_id, MetaData::default())
    }

    pub fn with_data(node_id: NodeId, data: MetaData) -> Self {
        Self {
            node_id,
            data: RwLock::new(Arc::new(data)),
        }
    }

    /// Current immutable snapshot.
    pub async fn snapshot(&self) -> Arc<MetaData> {
        self.data.read().await.clone()
    }

    /// Apply `f` to a copy of the current snapshot and publish the result.
    /// Nothing is published if `f` fails.
    pub async fn update<T, F>(&self, f: F) -> Result<T, MetaError>
    where
        F: FnOnce(&mut MetaData) -> Result<T, MetaError>,
    {
        let mut guard = self.data.write().await;
        let mut next = MetaData::clone(&guard);
        let out = f(&mut next)?;
        next.index += 1;
        *guard = Arc::new(next);
        Ok(out)
    }

    // --- Nodes ---

    pub async fn create_node(&self, host: &str) -> Result<NodeInfo, MetaError> {
        let node = self.update(|data| data.create_node(host)).await?;
        info!(node_id = node.id, host = %node.host, "node registered");
        Ok(node)
    }

    pub async fn add_node(&self, node: NodeInfo) -> Result<(), MetaError> {
        let (id, host) = (node.id, node.host.clone());
        self.update(|data| data.add_node(node)).await?;
        info!(node_id = id, host = %host, "node registered");
        Ok(())
    }

    pub async fn delete_node(&self, id: NodeId) -> Result<(), MetaError> {
        self.update(|data| data.delete_node(id)).await
    }

    pub async fn nodes(&self) -> Vec<NodeInfo> {
        self.snapshot().await.nodes.clone()
    }

    pub async fn node_by_host(&self, host: &str) -> Option<NodeInfo> {
        self.snapshot().await.node_by_host(host).cloned()
    }

    // --- Databases ---

    pub async fn create_database(&self, name: &str) -> Result<(), MetaError> {
        self.update(|data| data.create_database(name)).await
    }

    pub async fn drop_database(&self, name: &str) -> Result<(), MetaError> {
        self.update(|data| data.drop_database(name)).await
    }

    // --- Retention policies ---

    pub async fn create_retention_policy(
        &self,
        database: &str,
        spec: &RetentionPolicySpec,
    ) -> Result<(), MetaError> {
        self.update(|data| data.create_retention_policy(database, spec))
            .await
    }

    pub async fn create_retention_policy_if_not_exists(
        &self,
        database: &str,
        spec: &RetentionPolicySpec,
    ) -> Result<RetentionPolicyInfo, MetaError> {
        if let Some(existing) = self.snapshot().await.retention_policy(database, &spec.name)? {
            if existing.replica_n == spec.replica_n {
                return Ok(existing.clone());
            }
        }
        self.update(|data| data.create_retention_policy_if_not_exists(database, spec))
            .await
    }

    pub async fn drop_retention_policy(&self, database: &str, name: &str) -> Result<(), MetaError> {
        self.update(|data| data.drop_retention_policy(database, name))
            .await
    }

    pub async fn update_retention_policy(
        &self,
        database: &str,
        name: &str,
        update: &RetentionPolicyUpdate,
    ) -> Result<(), MetaError> {
        self.update(|data| data.update_retention_policy(database, name, update))
            .await
    }

    pub async fn set_default_retention_policy(
        &self,
        database: &str,
        name: &str,
    ) -> Result<(), MetaError> {
        self.update(|data| data.set_default_retention_policy(database, name))
            .await
    }

    // --- Shard groups ---

    pub async fn create_shard_group(
        &self,
        database: &str,
        policy: &str,
        timestamp: i64,
    ) -> Result<ShardGroupInfo, MetaError> {
        self.update(|data| data.create_shard_group(database, policy, timestamp))
            .await
    }

    pub async fn delete_shard_group(
        &self,
        database: &str,
        policy: &str,
        id: u64,
    ) -> Result<(), MetaError> {
        self.update(|data| data.delete_shard_group(database, policy, id))
            .await
    }

    pub async fn shard_groups_by_time_range(
        &self,
        database: &str,
        policy: &str,
        min: i64,
        max: i64,
    ) -> Result<Vec<ShardGroupInfo>, MetaError> {
        self.snapshot()
            .await
            .shard_groups_by_time_range(database, policy, min, max)
    }

    // --- Users ---

    pub async fn create_user(&self, name: &str, hash: &str, admin: bool) -> Result<(), MetaError> {
        self.update(|data| data.create_user(name, hash, admin)).await
    }

    pub async fn drop_user(&self, name: &str) -> Result<(), MetaError> {
        self.update(|data| data.drop_user(name)).await
    }

    pub async fn user(&self, name: &str) -> Option<UserInfo> {
        self.snapshot().await.user(name).cloned()
    }
}

#[async_trait]
impl MetaStore for LocalMetaStore {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    async fn database(&self, name: &str) -> Option<DatabaseInfo> {
        self.snapshot().await.database(name).cloned()
    }

    async fn retention_policy(
        &self,
        database: &str,
        name: &str,
    ) -> Result<Option<RetentionPolicyInfo>, MetaError> {
        Ok(self
            .snapshot()
            .await
            .retention_policy(database, name)?
            .cloned())
    }

    async fn create_shard_group_if_not_exists(
        &self,
        database: &str,
        policy: &str,
        timestamp: i64,
    ) -> Result<ShardGroupInfo, MetaError> {
        // Fast path on the published snapshot.
        {
            let snapshot = self.snapshot().await;
            let rp = snapshot
                .retention_policy(database, policy)?
                .ok_or_else(|| MetaError::RetentionPolicyNotFound(policy.to_string()))?;
            if let Some(group) = rp.shard_group_by_timestamp(timestamp) {
                return Ok(group.clone());
            }
        }

        // Re-check under the write lock: a concurrent writer may have
        // allocated the same bucket in the meantime.
        let group = self
            .update(|data| {
                let existing = data
                    .retention_policy(database, policy)?
                    .and_then(|rp| rp.shard_group_by_timestamp(timestamp))
                    .cloned();
                match existing {
                    Some(group) => Ok(group),
                    None => data.create_shard_group(database, policy, timestamp),
                }
            })
            .await?;
        debug!(
            database,
            policy,
            shard_group = group.id,
            start = group.start_time,
            shards = group.shards.len(),
            "shard group ready"
        );
        Ok(group)
    }

    async fn shard_owner(&self, shard_id: ShardId) -> Option<ShardOwner> {
        let snapshot = self.snapshot().await;
        snapshot
            .shard_owner(shard_id)
            .map(|(database, retention_policy, group)| ShardOwner {
                database: database.to_string(),
                retention_policy: retention_policy.to_string(),
                shard_group: group.clone(),
            })
    }

    async fn node(&self, id: NodeId) -> Option<NodeInfo> {
        self.snapshot().await.node(id).cloned()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use strata_common::HOUR_NANOS;

    async fn store(nodes: usize, replica_n: usize) -> LocalMetaStore {
        let store = LocalMetaStore::new(1);
        for i in 0..nodes {
            store.create_node(&format!("node{}:8088", i)).await.unwrap();
        }
        store.create_database("db0").await.unwrap();
        store
            .create_retention_policy(
                "db0",
                &RetentionPolicySpec {
                    name: "rp0".into(),
                    duration: Duration::ZERO,
                    replica_n,
                },
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_index_bumps_on_every_mutation() {
        let store = LocalMetaStore::new(1);
        assert_eq!(store.snapshot().await.index, 0);
        store.create_node("a:1").await.unwrap();
        store.create_database("db").await.unwrap();
        assert_eq!(store.snapshot().await.index, 2);

        // Failed mutations publish nothing.
        assert!(store.create_database("db").await.is_err());
        assert_eq!(store.snapshot().await.index, 2);
    }

    #[tokio::test]
    async fn test_old_snapshot_unchanged_after_update() {
        let store = store(1, 1).await;
        let before = store.snapshot().await;
        store.create_database("db1").await.unwrap();
        assert!(before.database("db1").is_none());
        assert!(store.snapshot().await.database("db1").is_some());
    }

    #[tokio::test]
    async fn test_create_shard_group_if_not_exists_is_idempotent() {
        let store = store(3, 1).await;
        let a = store
            .create_shard_group_if_not_exists("db0", "rp0", 100)
            .await
            .unwrap();
        let index = store.snapshot().await.index;
        let b = store
            .create_shard_group_if_not_exists("db0", "rp0", 200)
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(store.snapshot().await.index, index);
    }

    #[tokio::test]
    async fn test_concurrent_create_allocates_once() {
        let store = Arc::new(store(3, 1).await);
        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store
                    .create_shard_group_if_not_exists("db0", "rp0", i)
                    .await
                    .unwrap()
            }));
        }
        let groups: Vec<ShardGroupInfo> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert!(groups.iter().all(|g| g == &groups[0]));

        let rp = store
            .retention_policy("db0", "rp0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rp.shard_groups.len(), 1);
    }

    #[tokio::test]
    async fn test_create_shard_group_requires_nodes() {
        let store = store(0, 1).await;
        let err = store
            .create_shard_group_if_not_exists("db0", "rp0", 0)
            .await
            .unwrap_err();
        assert_eq!(err, MetaError::NodesRequired);
    }

    #[tokio::test]
    async fn test_lookup_errors() {
        let store = store(1, 1).await;
        let err = store.retention_policy("nope", "rp0").await.unwrap_err();
        assert!(err.to_string().contains("nope"));
        assert!(store.retention_policy("db0", "nope").await.unwrap().is_none());

        let err = store
            .create_shard_group_if_not_exists("db0", "nope", 0)
            .await
            .unwrap_err();
        assert_eq!(err, MetaError::RetentionPolicyNotFound("nope".into()));
    }

    #[tokio::test]
    async fn test_shard_owner_and_node_lookup() {
        let store = store(2, 2).await;
        let group = store
            .create_shard_group_if_not_exists("db0", "rp0", HOUR_NANOS)
            .await
            .unwrap();
        let owner = store.shard_owner(group.shards[0].id).await.unwrap();
        assert_eq!(owner.database, "db0");
        assert_eq!(owner.retention_policy, "rp0");
        assert_eq!(owner.shard_group.id, group.id);

        assert_eq!(store.node(2).await.unwrap().host, "node1:8088");
        assert!(store.node(42).await.is_none());
        assert_eq!(store.node_id(), 1);
    }

    #[tokio::test]
    async fn test_delete_then_recreate() {
        let store = store(1, 1).await;
        let group = store
            .create_shard_group_if_not_exists("db0", "rp0", 0)
            .await
            .unwrap();
        store.delete_shard_group("db0", "rp0", group.id).await.unwrap();
        let fresh = store
            .create_shard_group_if_not_exists("db0", "rp0", 0)
            .await
            .unwrap();
        assert_ne!(fresh.id, group.id);
        let live = store
            .shard_groups_by_time_range("db0", "rp0", i64::MIN, i64::MAX)
            .await
            .unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, fresh.id);
    }

    #[tokio::test]
    async fn test_users_roundtrip() {
        let store = LocalMetaStore::new(1);
        store.create_user("admin", "x", true).await.unwrap();
        assert!(store.user("admin").await.unwrap().admin);
        store.drop_user("admin").await.unwrap();
        assert!(store.user("admin").await.is_none());
    }
}
