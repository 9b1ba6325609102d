//! Assigns the points of a write to shards.
//!
//! Points are bucketed by their retention policy's shard group duration;
//! each bucket's shard group is looked up (or created) once, and within a
//! group a point's shard is `hash_id % shard_count`. The same series thus
//! always lands on the same shard of a group.

use crate::points_writer::WritePointsRequest;
use std::collections::BTreeMap;
use strata_common::{truncate_nanos, Point, ShardId};
use strata_meta::{MetaError, MetaStore, ShardGroupInfo, ShardInfo};

/// Points of a single write, grouped by destination shard.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ShardMapping {
    pub points: BTreeMap<ShardId, Vec<Point>>,
    pub shards: BTreeMap<ShardId, ShardInfo>,
}

impl ShardMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map_point(&mut self, shard: &ShardInfo, point: Point) {
        self.points.entry(shard.id).or_default().push(point);
        self.shards
            .entry(shard.id)
            .or_insert_with(|| shard.clone());
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// The shard of `group` that owns a series hash.
pub fn shard_for(group: &ShardGroupInfo, hash_id: u64) -> Option<&ShardInfo> {
    if group.shards.is_empty() {
        return None;
    }
    group.shards.get((hash_id % group.shards.len() as u64) as usize)
}

/// Build the shard mapping for `request`, creating missing shard groups.
///
/// `request.retention_policy` must already be resolved. Errors from the meta
/// store are returned unchanged and no partial mapping is produced.
pub async fn map_shards(
    meta: &dyn MetaStore,
    request: &WritePointsRequest,
) -> Result<ShardMapping, MetaError> {
    let rp = meta
        .retention_policy(&request.database, &request.retention_policy)
        .await?
        .ok_or_else(|| MetaError::RetentionPolicyNotFound(request.retention_policy.clone()))?;

    // One shard group lookup per distinct bucket.
    let mut groups: BTreeMap<i64, ShardGroupInfo> = BTreeMap::new();
    for point in &request.points {
        let bucket = truncate_nanos(point.time(), rp.shard_group_duration);
        if groups.contains_key(&bucket) {
            continue;
        }
        let group = meta
            .create_shard_group_if_not_exists(&request.database, &rp.name, point.time())
            .await?;
        groups.insert(bucket, group);
    }

    let mut mapping = ShardMapping::new();
    for point in &request.points {
        let bucket = truncate_nanos(point.time(), rp.shard_group_duration);
        let group = groups
            .get(&bucket)
            .ok_or(MetaError::ShardGroupNotFound(0))?;
        let shard =
            shard_for(group, point.hash_id()).ok_or(MetaError::ShardGroupNotFound(group.id))?;
        mapping.map_point(shard, point.clone());
    }
    Ok(mapping)
}
