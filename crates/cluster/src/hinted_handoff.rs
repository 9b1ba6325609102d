//! Durable queue for hinted-handoff writes.
//!
//! Each hint is a shard write that could not be delivered to its owner.
//! Hints are appended to a WAL at `<dir>/hints.wal`, kept in per-node FIFO
//! queues in memory, and acknowledged once delivered. Acks are also logged,
//! so a restart replays only the hints still pending. The log is rewritten
//! once enough acks accumulate.

use crate::shard_writer::{ShardWriter, WriteShardError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use strata_common::{now_nanos, NodeId, Point, ShardId};
use strata_storage::wal::{FsyncPolicy, Wal, WalError};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Acked entries tolerated in the log before it is rewritten.
const COMPACT_THRESHOLD: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum HintError {
    #[error("hint log error: {0}")]
    Wal(#[from] WalError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("hint queue for node {node_id} is full ({max} hints)")]
    QueueFull { node_id: NodeId, max: usize },
}

/// A write waiting to be delivered to `node_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hint {
    pub id: Uuid,
    pub node_id: NodeId,
    pub shard_id: ShardId,
    pub points: Vec<Point>,
    pub created_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
enum HintEntry {
    Queued(Hint),
    Acked { node_id: NodeId, id: Uuid },
}

#[derive(Debug)]
struct Queues {
    wal: Wal<HintEntry>,
    by_node: BTreeMap<NodeId, VecDeque<Hint>>,
    acked_since_compact: usize,
}

impl Queues {
    fn len(&self) -> usize {
        self.by_node.values().map(VecDeque::len).sum()
    }

    fn compact(&mut self) -> Result<(), HintError> {
        let live: Vec<HintEntry> = self
            .by_node
            .values()
            .flatten()
            .cloned()
            .map(HintEntry::Queued)
            .collect();
        self.wal.rewrite(&live)?;
        self.acked_since_compact = 0;
        tracing::debug!(pending = live.len(), "hint log compacted");
        Ok(())
    }
}

/// Per-node FIFO queues of undelivered writes, backed by a WAL.
pub struct HintedHandoffQueue {
    dir: PathBuf,
    max_hints_per_node: usize,
    queues: Mutex<Queues>,
}

impl std::fmt::Debug for HintedHandoffQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HintedHandoffQueue")
            .field("dir", &self.dir)
            .field("max_hints_per_node", &self.max_hints_per_node)
            .finish_non_exhaustive()
    }
}

impl HintedHandoffQueue {
    /// Open or create a queue at `dir`, replaying pending hints.
    ///
    /// Every enqueue and ack is fsynced before it returns.
    pub fn open(dir: &Path, max_hints_per_node: usize) -> Result<Self, HintError> {
        Self::open_with_fsync(dir, max_hints_per_node, FsyncPolicy::Always)
    }

    /// Like [`open`](Self::open) with an explicit fsync policy. Under
    /// [`FsyncPolicy::Batch`] the caller must call [`sync`](Self::sync)
    /// periodically.
    pub fn open_with_fsync(
        dir: &Path,
        max_hints_per_node: usize,
        fsync: FsyncPolicy,
    ) -> Result<Self, HintError> {
        std::fs::create_dir_all(dir)?;
        let wal_path = dir.join("hints.wal");

        let mut by_node: BTreeMap<NodeId, VecDeque<Hint>> = BTreeMap::new();
        let mut acked = 0usize;
        for entry in Wal::<HintEntry>::replay(&wal_path)? {
            match entry {
                HintEntry::Queued(hint) => by_node.entry(hint.node_id).or_default().push_back(hint),
                HintEntry::Acked { node_id, id } => {
                    if let Some(queue) = by_node.get_mut(&node_id) {
                        queue.retain(|h| h.id != id);
                    }
                    acked += 1;
                }
            }
        }
        by_node.retain(|_, q| !q.is_empty());

        let mut queues = Queues {
            wal: Wal::open(&wal_path, fsync)?,
            by_node,
            acked_since_compact: acked,
        };
        if queues.acked_since_compact > 0 {
            queues.compact()?;
        }

        tracing::info!(
            "hinted handoff queue opened: {} pending hint(s) at {:?}",
            queues.len(),
            dir
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            max_hints_per_node,
            queues: Mutex::new(queues),
        })
    }

    /// Queue a write for later delivery to `node_id`.
    pub async fn enqueue(
        &self,
        node_id: NodeId,
        shard_id: ShardId,
        points: &[Point],
    ) -> Result<Uuid, HintError> {
        let mut queues = self.queues.lock().await;
        let queued = queues.by_node.get(&node_id).map_or(0, VecDeque::len);
        if queued >= self.max_hints_per_node {
            return Err(HintError::QueueFull {
                node_id,
                max: self.max_hints_per_node,
            });
        }

        let hint = Hint {
            id: Uuid::new_v4(),
            node_id,
            shard_id,
            points: points.to_vec(),
            created_at: now_nanos(),
        };
        queues.wal.append(&HintEntry::Queued(hint.clone()))?;
        let id = hint.id;
        queues.by_node.entry(node_id).or_default().push_back(hint);

        strata_metrics::metrics().hints_queued.inc();
        Ok(id)
    }

    /// Pending hints for a node, oldest first.
    pub async fn pending(&self, node_id: NodeId) -> Vec<Hint> {
        let queues = self.queues.lock().await;
        queues
            .by_node
            .get(&node_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Nodes with at least one pending hint.
    pub async fn target_nodes(&self) -> Vec<NodeId> {
        self.queues.lock().await.by_node.keys().copied().collect()
    }

    /// Remove a delivered (or abandoned) hint. Returns whether it was queued.
    pub async fn ack(&self, node_id: NodeId, id: Uuid) -> Result<bool, HintError> {
        let mut queues = self.queues.lock().await;
        let Some(queue) = queues.by_node.get_mut(&node_id) else {
            return Ok(false);
        };
        let Some(pos) = queue.iter().position(|h| h.id == id) else {
            return Ok(false);
        };
        queue.remove(pos);
        if queue.is_empty() {
            queues.by_node.remove(&node_id);
        }

        queues.wal.append(&HintEntry::Acked { node_id, id })?;
        queues.acked_since_compact += 1;
        if queues.acked_since_compact >= COMPACT_THRESHOLD || queues.by_node.is_empty() {
            queues.compact()?;
        }
        Ok(true)
    }

    /// Total pending hints across all nodes.
    pub async fn len(&self) -> usize {
        self.queues.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queues.lock().await.by_node.is_empty()
    }

    pub async fn fsync_policy(&self) -> FsyncPolicy {
        self.queues.lock().await.wal.fsync_policy()
    }

    /// Flush the hint log to disk.
    pub async fn sync(&self) -> Result<(), HintError> {
        self.queues.lock().await.wal.sync()?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ShardWriter for HintedHandoffQueue {
    async fn write_shard(
        &self,
        shard_id: ShardId,
        owner_id: NodeId,
        points: &[Point],
    ) -> Result<(), WriteShardError> {
        self.enqueue(owner_id, shard_id, points)
            .await
            .map(|_| ())
            .map_err(|e| WriteShardError::Rejected(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
