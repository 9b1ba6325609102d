//! Metadata snapshot and the mutations applied to it.
//!
//! `MetaData` is a plain value. Stores never mutate a published snapshot;
//! they clone it, apply one of the mutations below, and publish the result.

use crate::MetaError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strata_common::{
    bucket_end, duration_nanos, now_nanos, truncate_nanos, NodeId, ShardId, DAY_NANOS,
};

/// Retention durations below this are rejected (zero means infinite).
pub const MIN_RETENTION_POLICY_DURATION: Duration = Duration::from_secs(3600);

const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(24 * 3600);
const WEEK: Duration = Duration::from_secs(7 * 24 * 3600);

/// Shard group bucket size for a retention duration.
///
/// Infinite (zero) or six-month-plus retention buckets by week, two days or
/// more by day, anything shorter by hour.
pub fn shard_group_duration(retention: Duration) -> Duration {
    let nanos = duration_nanos(retention);
    if nanos == 0 || nanos >= 180 * DAY_NANOS {
        WEEK
    } else if nanos >= 2 * DAY_NANOS {
        DAY
    } else {
        HOUR
    }
}

// ---------------------------------------------------------------------------
// Data shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub id: ShardId,
    /// Replica set. Order is preserved but carries no priority.
    pub owner_ids: Vec<NodeId>,
}

impl ShardInfo {
    pub fn owned_by(&self, node_id: NodeId) -> bool {
        self.owner_ids.contains(&node_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardGroupInfo {
    pub id: u64,
    /// Inclusive start, nanoseconds since epoch.
    pub start_time: i64,
    /// Exclusive end, nanoseconds since epoch.
    pub end_time: i64,
    /// Tombstone timestamp. Deleted groups stay listed so they can be swept.
    pub deleted_at: Option<i64>,
    pub shards: Vec<ShardInfo>,
}

impl ShardGroupInfo {
    /// `end_time` is exclusive, except that a group ending at `i64::MAX`
    /// also holds `i64::MAX`.
    pub fn contains(&self, t: i64) -> bool {
        self.start_time <= t && (t < self.end_time || (t == i64::MAX && self.end_time == i64::MAX))
    }

    pub fn overlaps(&self, min: i64, max: i64) -> bool {
        self.start_time <= max && self.end_time > min
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn shard(&self, id: ShardId) -> Option<&ShardInfo> {
        self.shards.iter().find(|s| s.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicyInfo {
    pub name: String,
    /// How long data is kept. Zero keeps data forever.
    pub duration: Duration,
    pub shard_group_duration: Duration,
    pub replica_n: usize,
    /// Sorted by start time.
    pub shard_groups: Vec<ShardGroupInfo>,
}

impl RetentionPolicyInfo {
    pub fn new(name: impl Into<String>, duration: Duration, replica_n: usize) -> Self {
        Self {
            name: name.into(),
            duration,
            shard_group_duration: shard_group_duration(duration),
            replica_n,
            shard_groups: Vec::new(),
        }
    }

    /// The live shard group covering `t`, if any.
    pub fn shard_group_by_timestamp(&self, t: i64) -> Option<&ShardGroupInfo> {
        self.shard_groups
            .iter()
            .find(|g| !g.is_deleted() && g.contains(t))
    }

    pub fn shard_group(&self, id: u64) -> Option<&ShardGroupInfo> {
        self.shard_groups.iter().find(|g| g.id == id)
    }
}

/// Parameters for a new retention policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicySpec {
    pub name: String,
    pub duration: Duration,
    pub replica_n: usize,
}

/// Partial update of an existing retention policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicyUpdate {
    pub name: Option<String>,
    pub duration: Option<Duration>,
    pub replica_n: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    /// Empty until the first retention policy is created.
    pub default_retention_policy: String,
    pub retention_policies: Vec<RetentionPolicyInfo>,
}

impl DatabaseInfo {
    pub fn retention_policy(&self, name: &str) -> Option<&RetentionPolicyInfo> {
        self.retention_policies.iter().find(|rp| rp.name == name)
    }

    fn retention_policy_mut(&mut self, name: &str) -> Option<&mut RetentionPolicyInfo> {
        self.retention_policies.iter_mut().find(|rp| rp.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    /// Opaque credential hash, produced by the caller.
    pub hash: String,
    pub admin: bool,
}

// ---------------------------------------------------------------------------
// MetaData
// ---------------------------------------------------------------------------

/// One version of the cluster metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaData {
    /// Monotonic version, bumped by the store on every committed mutation.
    pub index: u64,
    /// Sorted by ID.
    pub nodes: Vec<NodeInfo>,
    pub databases: Vec<DatabaseInfo>,
    pub users: Vec<UserInfo>,
    pub max_node_id: NodeId,
    pub max_shard_group_id: u64,
    pub max_shard_id: ShardId,
}

impl MetaData {
    // --- Nodes ---

    pub fn node(&self, id: NodeId) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_by_host(&self, host: &str) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.host == host)
    }

    /// Register a node under the next free ID.
    pub fn create_node(&mut self, host: &str) -> Result<NodeInfo, MetaError> {
        let node = NodeInfo {
            id: self.max_node_id + 1,
            host: host.to_string(),
        };
        self.add_node(node.clone())?;
        Ok(node)
    }

    /// Register a node with a caller-chosen ID.
    pub fn add_node(&mut self, node: NodeInfo) -> Result<(), MetaError> {
        if self.node(node.id).is_some() {
            return Err(MetaError::NodeExists(node.id.to_string()));
        }
        if self.node_by_host(&node.host).is_some() {
            return Err(MetaError::NodeExists(node.host));
        }
        self.max_node_id = self.max_node_id.max(node.id);
        self.nodes.push(node);
        self.nodes.sort_by_key(|n| n.id);
        Ok(())
    }

    pub fn delete_node(&mut self, id: NodeId) -> Result<(), MetaError> {
        let before = self.nodes.len();
        self.nodes.retain(|n| n.id != id);
        if self.nodes.len() == before {
            return Err(MetaError::NodeNotFound(id));
        }
        Ok(())
    }

    // --- Databases ---

    pub fn database(&self, name: &str) -> Option<&DatabaseInfo> {
        self.databases.iter().find(|db| db.name == name)
    }

    fn database_mut(&mut self, name: &str) -> Result<&mut DatabaseInfo, MetaError> {
        self.databases
            .iter_mut()
            .find(|db| db.name == name)
            .ok_or_else(|| MetaError::DatabaseNotFound(name.to_string()))
    }

    pub fn create_database(&mut self, name: &str) -> Result<(), MetaError> {
        if name.is_empty() {
            return Err(MetaError::DatabaseNameRequired);
        }
        if self.database(name).is_some() {
            return Err(MetaError::DatabaseExists(name.to_string()));
        }
        self.databases.push(DatabaseInfo {
            name: name.to_string(),
            default_retention_policy: String::new(),
            retention_policies: Vec::new(),
        });
        Ok(())
    }

    pub fn drop_database(&mut self, name: &str) -> Result<(), MetaError> {
        let before = self.databases.len();
        self.databases.retain(|db| db.name != name);
        if self.databases.len() == before {
            return Err(MetaError::DatabaseNotFound(name.to_string()));
        }
        Ok(())
    }

    // --- Retention policies ---

    /// Look up a retention policy. An unknown database is an error; an
    /// unknown policy in a known database is `Ok(None)`.
    pub fn retention_policy(
        &self,
        database: &str,
        name: &str,
    ) -> Result<Option<&RetentionPolicyInfo>, MetaError> {
        let db = self
            .database(database)
            .ok_or_else(|| MetaError::DatabaseNotFound(database.to_string()))?;
        Ok(db.retention_policy(name))
    }

    fn retention_policy_mut(
        &mut self,
        database: &str,
        name: &str,
    ) -> Result<&mut RetentionPolicyInfo, MetaError> {
        self.database_mut(database)?
            .retention_policy_mut(name)
            .ok_or_else(|| MetaError::RetentionPolicyNotFound(name.to_string()))
    }

    pub fn create_retention_policy(
        &mut self,
        database: &str,
        spec: &RetentionPolicySpec,
    ) -> Result<(), MetaError> {
        validate_policy(&spec.name, spec.duration, spec.replica_n)?;
        let db = self.database_mut(database)?;
        if db.retention_policy(&spec.name).is_some() {
            return Err(MetaError::RetentionPolicyExists(spec.name.clone()));
        }
        db.retention_policies.push(RetentionPolicyInfo::new(
            spec.name.clone(),
            spec.duration,
            spec.replica_n,
        ));
        if db.default_retention_policy.is_empty() {
            db.default_retention_policy = spec.name.clone();
        }
        Ok(())
    }

    /// Create a retention policy unless one with the same name exists. An
    /// existing policy is accepted only if its replication factor matches.
    pub fn create_retention_policy_if_not_exists(
        &mut self,
        database: &str,
        spec: &RetentionPolicySpec,
    ) -> Result<RetentionPolicyInfo, MetaError> {
        if let Some(existing) = self.retention_policy(database, &spec.name)? {
            if existing.replica_n != spec.replica_n {
                return Err(MetaError::ReplicationFactorMismatch {
                    existing: existing.replica_n,
                    requested: spec.replica_n,
                });
            }
            return Ok(existing.clone());
        }
        self.create_retention_policy(database, spec)?;
        self.retention_policy(database, &spec.name)?
            .cloned()
            .ok_or_else(|| MetaError::RetentionPolicyNotFound(spec.name.clone()))
    }

    pub fn drop_retention_policy(&mut self, database: &str, name: &str) -> Result<(), MetaError> {
        let db = self.database_mut(database)?;
        let before = db.retention_policies.len();
        db.retention_policies.retain(|rp| rp.name != name);
        if db.retention_policies.len() == before {
            return Err(MetaError::RetentionPolicyNotFound(name.to_string()));
        }
        if db.default_retention_policy == name {
            db.default_retention_policy.clear();
        }
        Ok(())
    }

    pub fn update_retention_policy(
        &mut self,
        database: &str,
        name: &str,
        update: &RetentionPolicyUpdate,
    ) -> Result<(), MetaError> {
        if let Some(new_name) = &update.name {
            if new_name.is_empty() {
                return Err(MetaError::RetentionPolicyNameRequired);
            }
            if new_name != name && self.retention_policy(database, new_name)?.is_some() {
                return Err(MetaError::RetentionPolicyExists(new_name.clone()));
            }
        }
        if let Some(duration) = update.duration {
            check_duration(duration)?;
        }
        if update.replica_n == Some(0) {
            return Err(MetaError::ReplicationFactorTooLow);
        }

        let db = self.database_mut(database)?;
        let rp = db
            .retention_policy_mut(name)
            .ok_or_else(|| MetaError::RetentionPolicyNotFound(name.to_string()))?;
        if let Some(duration) = update.duration {
            rp.duration = duration;
            rp.shard_group_duration = shard_group_duration(duration);
        }
        if let Some(replica_n) = update.replica_n {
            rp.replica_n = replica_n;
        }
        if let Some(new_name) = &update.name {
            rp.name = new_name.clone();
            if db.default_retention_policy == name {
                db.default_retention_policy = new_name.clone();
            }
        }
        Ok(())
    }

    pub fn set_default_retention_policy(
        &mut self,
        database: &str,
        name: &str,
    ) -> Result<(), MetaError> {
        let db = self.database_mut(database)?;
        if db.retention_policy(name).is_none() {
            return Err(MetaError::RetentionPolicyNotFound(name.to_string()));
        }
        db.default_retention_policy = name.to_string();
        Ok(())
    }

    // --- Shard groups ---

    /// Live shard groups overlapping `[min, max]`, ordered by start time.
    pub fn shard_groups_by_time_range(
        &self,
        database: &str,
        policy: &str,
        min: i64,
        max: i64,
    ) -> Result<Vec<ShardGroupInfo>, MetaError> {
        let rp = self
            .retention_policy(database, policy)?
            .ok_or_else(|| MetaError::RetentionPolicyNotFound(policy.to_string()))?;
        Ok(rp
            .shard_groups
            .iter()
            .filter(|g| !g.is_deleted() && g.overlaps(min, max))
            .cloned()
            .collect())
    }

    /// Allocate a shard group for the bucket containing `timestamp`.
    ///
    /// Fails with `ShardGroupExists` if a live group already covers it.
    pub fn create_shard_group(
        &mut self,
        database: &str,
        policy: &str,
        timestamp: i64,
    ) -> Result<ShardGroupInfo, MetaError> {
        if self.nodes.is_empty() {
            return Err(MetaError::NodesRequired);
        }
        let rp = self
            .retention_policy(database, policy)?
            .ok_or_else(|| MetaError::RetentionPolicyNotFound(policy.to_string()))?;
        if rp.shard_group_by_timestamp(timestamp).is_some() {
            return Err(MetaError::ShardGroupExists);
        }
        let group_duration = rp.shard_group_duration;
        let node_count = self.nodes.len();
        let replica_n = rp.replica_n.clamp(1, node_count);
        let shard_n = node_count / replica_n;

        self.max_shard_group_id += 1;
        let start_time = truncate_nanos(timestamp, group_duration);
        let mut group = ShardGroupInfo {
            id: self.max_shard_group_id,
            start_time,
            end_time: bucket_end(start_time, group_duration),
            deleted_at: None,
            shards: Vec::with_capacity(shard_n),
        };

        // Round-robin owners, starting at an index-derived offset so that
        // successive groups don't all begin on the first node.
        let mut node_index = (self.index % node_count as u64) as usize;
        for _ in 0..shard_n {
            self.max_shard_id += 1;
            let mut owner_ids = Vec::with_capacity(replica_n);
            for _ in 0..replica_n {
                owner_ids.push(self.nodes[node_index % node_count].id);
                node_index += 1;
            }
            group.shards.push(ShardInfo {
                id: self.max_shard_id,
                owner_ids,
            });
        }

        let rp = self.retention_policy_mut(database, policy)?;
        rp.shard_groups.push(group.clone());
        rp.shard_groups.sort_by_key(|g| g.start_time);
        Ok(group)
    }

    /// Tombstone a shard group.
    pub fn delete_shard_group(
        &mut self,
        database: &str,
        policy: &str,
        id: u64,
    ) -> Result<(), MetaError> {
        let rp = self.retention_policy_mut(database, policy)?;
        let group = rp
            .shard_groups
            .iter_mut()
            .find(|g| g.id == id)
            .ok_or(MetaError::ShardGroupNotFound(id))?;
        if group.deleted_at.is_none() {
            group.deleted_at = Some(now_nanos());
        }
        Ok(())
    }

    /// Locate the database, policy and group that own a shard.
    pub fn shard_owner(&self, shard_id: ShardId) -> Option<(&str, &str, &ShardGroupInfo)> {
        for db in &self.databases {
            for rp in &db.retention_policies {
                for group in &rp.shard_groups {
                    if group.shard(shard_id).is_some() {
                        return Some((&db.name, &rp.name, group));
                    }
                }
            }
        }
        None
    }

    // --- Users ---

    pub fn user(&self, name: &str) -> Option<&UserInfo> {
        self.users.iter().find(|u| u.name == name)
    }

    pub fn create_user(&mut self, name: &str, hash: &str, admin: bool) -> Result<(), MetaError> {
        if name.is_empty() {
            return Err(MetaError::UsernameRequired);
        }
        if self.user(name).is_some() {
            return Err(MetaError::UserExists(name.to_string()));
        }
        self.users.push(UserInfo {
            name: name.to_string(),
            hash: hash.to_string(),
            admin,
        });
        Ok(())
    }

    pub fn drop_user(&mut self, name: &str) -> Result<(), MetaError> {
        let before = self.users.len();
        self.users.retain(|u| u.name != name);
        if self.users.len() == before {
            return Err(MetaError::UserNotFound(name.to_string()));
        }
        Ok(())
    }
}

fn validate_policy(name: &str, duration: Duration, replica_n: usize) -> Result<(), MetaError> {
    if name.is_empty() {
        return Err(MetaError::RetentionPolicyNameRequired);
    }
    check_duration(duration)?;
    if replica_n == 0 {
        return Err(MetaError::ReplicationFactorTooLow);
    }
    Ok(())
}

fn check_duration(duration: Duration) -> Result<(), MetaError> {
    if !duration.is_zero() && duration < MIN_RETENTION_POLICY_DURATION {
        return Err(MetaError::RetentionPolicyDurationTooLow {
            min: MIN_RETENTION_POLICY_DURATION,
            got: duration,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
