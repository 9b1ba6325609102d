//! Cluster metadata for strata.
//!
//! Holds the data shapes (nodes, databases, retention policies, shard groups,
//! users), the shard group allocator, the [`MetaStore`] capability consumed
//! by the write and query paths, and [`LocalMetaStore`], an in-process
//! copy-on-write implementation of it.

pub mod data;
pub mod store;

pub use data::{
    shard_group_duration, DatabaseInfo, MetaData, NodeInfo, RetentionPolicyInfo,
    RetentionPolicySpec, RetentionPolicyUpdate, ShardGroupInfo, ShardInfo, UserInfo,
    MIN_RETENTION_POLICY_DURATION,
};
pub use store::{LocalMetaStore, MetaStore, ShardOwner};

use std::time::Duration;
use strata_common::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetaError {
    #[error("at least one node required")]
    NodesRequired,
    #[error("node already exists: {0}")]
    NodeExists(String),
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("database name required")]
    DatabaseNameRequired,
    #[error("database already exists: {0}")]
    DatabaseExists(String),
    #[error("database not found: {0}")]
    DatabaseNotFound(String),

    #[error("retention policy name required")]
    RetentionPolicyNameRequired,
    #[error("retention policy already exists: {0}")]
    RetentionPolicyExists(String),
    #[error("retention policy not found: {0}")]
    RetentionPolicyNotFound(String),
    #[error("retention policy duration must be at least {min:?}, got {got:?}")]
    RetentionPolicyDurationTooLow { min: Duration, got: Duration },
    #[error("replication factor must be greater than 0")]
    ReplicationFactorTooLow,
    #[error("replication factor mismatch: existing {existing}, requested {requested}")]
    ReplicationFactorMismatch { existing: usize, requested: usize },

    #[error("shard group already exists")]
    ShardGroupExists,
    #[error("shard group not found: {0}")]
    ShardGroupNotFound(u64),

    #[error("username required")]
    UsernameRequired,
    #[error("user already exists: {0}")]
    UserExists(String),
    #[error("user not found: {0}")]
    UserNotFound(String),
}
