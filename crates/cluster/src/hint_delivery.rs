//! Background task for delivering hinted-handoff hints.
//!
//! Periodically walks the hint queue and replays pending writes to their
//! owners through the remote shard writer, oldest first per node.

use crate::hinted_handoff::HintedHandoffQueue;
use crate::shard_writer::{is_retryable, ShardWriter};
use std::sync::Arc;
use strata_meta::MetaStore;
use tokio::time::{interval, Duration};

/// Configuration for the hint delivery background task.
#[derive(Debug, Clone)]
pub struct HintDeliveryConfig {
    /// How often to check for undelivered hints.
    pub check_interval: Duration,
    /// Maximum hints to attempt per delivery cycle.
    pub max_hints_per_cycle: usize,
}

impl Default for HintDeliveryConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            max_hints_per_cycle: 100,
        }
    }
}

/// Outcome of one delivery cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: usize,
    /// Hints abandoned because the owner rejected them outright.
    pub dropped: usize,
}

/// Spawn the background hint delivery task.
///
/// Returns a `JoinHandle` for the spawned task.
#[allow(clippy::needless_pass_by_value)] // config is moved into the spawned task
pub fn spawn_hint_delivery_task(
    queue: Arc<HintedHandoffQueue>,
    meta: Arc<dyn MetaStore>,
    writer: Arc<dyn ShardWriter>,
    config: HintDeliveryConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(config.check_interval);
        loop {
            tick.tick().await;
            deliver_hints(
                &queue,
                meta.as_ref(),
                writer.as_ref(),
                config.max_hints_per_cycle,
            )
            .await;
        }
    })
}

/// One cycle of hint delivery.
///
/// A retryable failure stops delivery to that node for this cycle, keeping
/// its remaining hints in order. Any other failure means the owner will
/// never accept the write, so the hint is dropped.
pub async fn deliver_hints(
    queue: &HintedHandoffQueue,
    meta: &dyn MetaStore,
    writer: &dyn ShardWriter,
    max_hints: usize,
) -> DeliveryStats {
    let mut stats = DeliveryStats::default();
    let target_nodes = queue.target_nodes().await;
    if target_nodes.is_empty() {
        return stats;
    }

    let m = strata_metrics::metrics();
    let mut attempted = 0usize;

    'nodes: for node_id in target_nodes {
        if attempted >= max_hints {
            break;
        }

        if meta.node(node_id).await.is_none() {
            tracing::debug!("hint target {} not in cluster, skipping", node_id);
            continue;
        }

        for hint in queue.pending(node_id).await {
            if attempted >= max_hints {
                break 'nodes;
            }
            attempted += 1;

            match writer.write_shard(hint.shard_id, node_id, &hint.points).await {
                Ok(()) => {
                    if let Err(e) = queue.ack(node_id, hint.id).await {
                        tracing::warn!("failed to ack delivered hint: {}", e);
                    }
                    stats.delivered += 1;
                    m.hints_delivered.inc();
                    tracing::debug!(
                        "delivered hint {} (shard {}) to node {}",
                        hint.id,
                        hint.shard_id,
                        node_id
                    );
                }
                Err(e) if is_retryable(&e) => {
                    tracing::debug!(
                        "hint delivery to {} failed: {}, will retry later",
                        node_id,
                        e
                    );
                    continue 'nodes;
                }
                Err(e) => {
                    tracing::warn!(
                        "dropping hint {} for shard {} on node {}: {}",
                        hint.id,
                        hint.shard_id,
                        node_id,
                        e
                    );
                    if let Err(e) = queue.ack(node_id, hint.id).await {
                        tracing::warn!("failed to ack dropped hint: {}", e);
                    }
                    stats.dropped += 1;
                    m.hints_dropped.inc();
                }
            }
        }
    }

    if stats.delivered > 0 || stats.dropped > 0 {
        tracing::info!(
            "hint delivery cycle: delivered {} hint(s), dropped {}",
            stats.delivered,
            stats.dropped
        );
    }
    stats
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
