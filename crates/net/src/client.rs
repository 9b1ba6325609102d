//! TCP client implementing `ShardWriter`.
//!
//! `RemoteShardWriter` checks out a pooled connection to the owner, sends a
//! framed `WriteShardRequest` and waits for the `WriteShardResponse`.

use crate::frame::MessageType;
use crate::pool::PoolRegistry;
use crate::wire::{WriteShardRequest, WriteShardResponse, CODE_OK};
use crate::TransportError;
use std::sync::Arc;
use strata_cluster::{ShardWriter, WriteShardError};
use strata_common::{NodeId, Point, ShardId};
use tokio::time::Duration;

/// Writes shard batches to remote owners over pooled TCP connections.
#[derive(Debug)]
pub struct RemoteShardWriter {
    pools: Arc<PoolRegistry>,
    timeout: Duration,
}

impl RemoteShardWriter {
    pub fn new(pools: Arc<PoolRegistry>, timeout: Duration) -> Self {
        Self { pools, timeout }
    }

    async fn send(
        &self,
        shard_id: ShardId,
        owner_id: NodeId,
        points: &[Point],
    ) -> Result<WriteShardResponse, TransportError> {
        let mut conn = self.pools.dial(owner_id).await?;
        conn.round_trip(
            MessageType::WriteShardRequest,
            &WriteShardRequest::new(shard_id, points),
            MessageType::WriteShardResponse,
        )
        .await
    }
}

#[async_trait::async_trait]
impl ShardWriter for RemoteShardWriter {
    async fn write_shard(
        &self,
        shard_id: ShardId,
        owner_id: NodeId,
        points: &[Point],
    ) -> Result<(), WriteShardError> {
        let m = strata_metrics::metrics();
        let _timer = strata_metrics::start_shard_request_timer("write_shard", "outbound");

        let result = match tokio::time::timeout(self.timeout, self.send(shard_id, owner_id, points)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                m.shard_request_failures
                    .with_label_values(&["write_shard"])
                    .inc();
                tracing::debug!(shard_id, owner_id, "write_shard failed: {}", e);
                return Err(e.into());
            }
        };

        if resp.code != CODE_OK {
            m.shard_request_failures
                .with_label_values(&["write_shard"])
                .inc();
            return Err(WriteShardError::Remote {
                code: resp.code,
                message: resp.message,
            });
        }
        Ok(())
    }
}
