//! Abstraction over writing a batch of points to a shard on another node.
//!
//! Concrete implementation lives in `strata-net::client`. The hinted-handoff
//! queue implements the same trait, so the points writer can fall back to it
//! without caring what it is.

use strata_common::{NodeId, Point, ShardId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteShardError {
    /// I/O or connection failure talking to the owner.
    #[error("{0}")]
    Transport(String),
    #[error("timeout")]
    Timeout,
    /// The owner answered with a non-zero response code.
    #[error("error code {code}: {message}")]
    Remote { code: i32, message: String },
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),
    /// The writer refused the batch without attempting delivery.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Whether a failed shard write may succeed if tried again later.
///
/// Shared by the points writer (hinted-handoff eligibility) and hint
/// delivery (keep the hint vs. drop it).
pub fn is_retryable(err: &WriteShardError) -> bool {
    matches!(err, WriteShardError::Transport(_) | WriteShardError::Timeout)
}

#[async_trait::async_trait]
pub trait ShardWriter: Send + Sync + 'static {
    /// Write `points` to shard `shard_id` on node `owner_id`.
    async fn write_shard(
        &self,
        shard_id: ShardId,
        owner_id: NodeId,
        points: &[Point],
    ) -> Result<(), WriteShardError>;
}
