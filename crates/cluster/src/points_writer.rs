//! Points writer: replicates a write to every owner of every shard it touches.
//!
//! The writer:
//! 1. Resolves the retention policy (empty means the database default)
//! 2. Maps points to shards, creating shard groups as needed
//! 3. Writes each shard's batch in parallel, one task per shard
//! 4. Within a shard, writes to every owner in parallel, locally or through
//!    the remote [`ShardWriter`], falling back to hinted handoff on
//!    retryable remote failures
//! 5. Counts owner acks against the consistency level
//!
//! Dispatched tasks are never cancelled. When the writer is closed, or a
//! shard fails first, the caller gets its answer right away and the
//! remaining tasks run to completion with their results discarded.

use crate::shard_mapper::map_shards;
use crate::shard_writer::{is_retryable, ShardWriter, WriteShardError};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::sync::Arc;
use strata_common::{ConsistencyLevel, NodeId, Point, ShardId};
use strata_meta::{MetaError, MetaStore, ShardInfo};
use strata_storage::{DataStore, StoreError};
use tokio::sync::watch;
use tokio::time::Duration;

/// A batch of points bound for one database and retention policy.
#[derive(Debug, Clone, PartialEq)]
pub struct WritePointsRequest {
    pub database: String,
    /// Empty selects the database's default retention policy.
    pub retention_policy: String,
    pub consistency: ConsistencyLevel,
    pub points: Vec<Point>,
}

impl WritePointsRequest {
    pub fn new(database: impl Into<String>, retention_policy: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            retention_policy: retention_policy.into(),
            consistency: ConsistencyLevel::default(),
            points: Vec::new(),
        }
    }

    pub fn with_consistency(mut self, consistency: ConsistencyLevel) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn add_point(&mut self, point: Point) {
        self.points.push(point);
    }
}

/// Failure of a single owner write.
#[derive(Debug, thiserror::Error)]
pub enum OwnerError {
    #[error(transparent)]
    Local(#[from] StoreError),
    #[error(transparent)]
    Remote(#[from] WriteShardError),
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("timeout")]
    Timeout,
    #[error("partial write")]
    PartialWrite,
    #[error("write failed")]
    WriteFailed,
    /// No owner acknowledged; carries the first owner error observed.
    #[error("write failed: {0}")]
    Failed(OwnerError),
    #[error(transparent)]
    Meta(#[from] MetaError),
}

/// Coordinates replicated point writes.
///
/// Cheap to clone; clones share collaborators and the close signal.
#[derive(Clone)]
pub struct PointsWriter {
    node_id: NodeId,
    meta: Arc<dyn MetaStore>,
    store: Arc<dyn DataStore>,
    shard_writer: Arc<dyn ShardWriter>,
    hinted_handoff: Option<Arc<dyn ShardWriter>>,
    write_timeout: Duration,
    closing: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for PointsWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointsWriter")
            .field("node_id", &self.node_id)
            .field("write_timeout", &self.write_timeout)
            .field("hinted_handoff", &self.hinted_handoff.is_some())
            .finish_non_exhaustive()
    }
}

impl PointsWriter {
    pub fn new(
        meta: Arc<dyn MetaStore>,
        store: Arc<dyn DataStore>,
        shard_writer: Arc<dyn ShardWriter>,
        write_timeout: Duration,
    ) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            node_id: meta.node_id(),
            meta,
            store,
            shard_writer,
            hinted_handoff: None,
            write_timeout,
            closing: Arc::new(closing),
        }
    }

    /// Attach a hinted-handoff writer for retryable remote failures.
    pub fn with_hinted_handoff(mut self, hinted_handoff: Arc<dyn ShardWriter>) -> Self {
        self.hinted_handoff = Some(hinted_handoff);
        self
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Signal every in-progress and future write to return `WriteFailed`.
    pub fn close(&self) {
        self.closing.send_replace(true);
        tracing::info!("points writer closed");
    }

    pub fn is_closed(&self) -> bool {
        *self.closing.borrow()
    }

    // -----------------------------------------------------------------------
    // write_points
    // -----------------------------------------------------------------------

    /// Write a batch, returning the first shard failure observed.
    pub async fn write_points(&self, mut request: WritePointsRequest) -> Result<(), WriteError> {
        let m = strata_metrics::metrics();
        m.write_requests.inc();
        m.points_written.inc_by(request.points.len() as u64);
        let _timer = strata_metrics::start_write_timer(request.consistency.as_str());

        if self.is_closed() {
            return Err(WriteError::WriteFailed);
        }

        if request.retention_policy.is_empty() {
            let db = self
                .meta
                .database(&request.database)
                .await
                .ok_or_else(|| MetaError::DatabaseNotFound(request.database.clone()))?;
            request.retention_policy = db.default_retention_policy;
        }

        let mut mapping = map_shards(self.meta.as_ref(), &request).await?;
        tracing::debug!(
            database = %request.database,
            policy = %request.retention_policy,
            points = request.points.len(),
            shards = mapping.points.len(),
            "writing points"
        );

        let mut futs = FuturesUnordered::new();
        for (shard_id, points) in std::mem::take(&mut mapping.points) {
            let Some(shard) = mapping.shards.remove(&shard_id) else {
                continue;
            };
            let writer = self.clone();
            let database = request.database.clone();
            let policy = request.retention_policy.clone();
            let consistency = request.consistency;
            futs.push(tokio::spawn(async move {
                writer
                    .write_to_shard(&shard, &database, &policy, consistency, points)
                    .await
            }));
        }

        let closed = closed(self.closing.subscribe());
        tokio::pin!(closed);
        loop {
            tokio::select! {
                biased;
                _ = &mut closed => return Err(WriteError::WriteFailed),
                next = futs.next() => match next {
                    None => return Ok(()),
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => return Err(e),
                    Some(Err(e)) => {
                        tracing::warn!("shard write task failed: {}", e);
                        return Err(WriteError::WriteFailed);
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // write_to_shard
    // -----------------------------------------------------------------------

    /// Write `points` to every owner of `shard` and resolve the outcome
    /// against `consistency`.
    pub async fn write_to_shard(
        &self,
        shard: &ShardInfo,
        database: &str,
        policy: &str,
        consistency: ConsistencyLevel,
        points: Vec<Point>,
    ) -> Result<(), WriteError> {
        let required = consistency.required_acks(shard.owner_ids.len());
        let points: Arc<[Point]> = points.into();
        let deadline = tokio::time::Instant::now() + self.write_timeout;
        let mut futs = FuturesUnordered::new();

        for &owner_id in &shard.owner_ids {
            let writer = self.clone();
            let points = Arc::clone(&points);
            let database = database.to_string();
            let policy = policy.to_string();
            let shard_id = shard.id;
            futs.push(tokio::spawn(async move {
                let result = writer
                    .write_to_owner(owner_id, shard_id, &database, &policy, consistency, &points)
                    .await;
                (owner_id, result)
            }));
        }

        let m = strata_metrics::metrics();
        let closed = closed(self.closing.subscribe());
        tokio::pin!(closed);
        let mut acked = 0usize;
        let mut write_error: Option<OwnerError> = None;

        loop {
            tokio::select! {
                biased;
                _ = &mut closed => return Err(WriteError::WriteFailed),
                next = tokio::time::timeout_at(deadline, futs.next()) => match next {
                    Err(_) => {
                        m.write_outcomes.with_label_values(&["timeout"]).inc();
                        tracing::warn!(shard_id = shard.id, acked, required, "shard write timed out");
                        return Err(WriteError::Timeout);
                    }
                    Ok(None) => break,
                    Ok(Some(Ok((_, Ok(()))))) => acked += 1,
                    Ok(Some(Ok((owner_id, Err(e))))) => {
                        tracing::warn!(shard_id = shard.id, owner_id, "write to owner failed: {}", e);
                        write_error.get_or_insert(e);
                    }
                    Ok(Some(Err(e))) => {
                        tracing::warn!(shard_id = shard.id, "owner write task failed: {}", e);
                    }
                }
            }
        }

        if acked >= required {
            m.write_outcomes.with_label_values(&["ok"]).inc();
            return Ok(());
        }
        if acked > 0 {
            m.write_outcomes.with_label_values(&["partial"]).inc();
            return Err(WriteError::PartialWrite);
        }
        m.write_outcomes.with_label_values(&["error"]).inc();
        match write_error {
            Some(e) => Err(WriteError::Failed(e)),
            None => Err(WriteError::WriteFailed),
        }
    }

    async fn write_to_owner(
        &self,
        owner_id: NodeId,
        shard_id: ShardId,
        database: &str,
        policy: &str,
        consistency: ConsistencyLevel,
        points: &[Point],
    ) -> Result<(), OwnerError> {
        let m = strata_metrics::metrics();

        if owner_id == self.node_id {
            m.point_requests.with_label_values(&["local"]).inc();
            return match self.store.write_to_shard(shard_id, points).await {
                Err(StoreError::ShardNotFound(_)) => {
                    self.store.create_shard(database, policy, shard_id).await?;
                    self.store.write_to_shard(shard_id, points).await?;
                    Ok(())
                }
                other => Ok(other?),
            };
        }

        m.point_requests.with_label_values(&["remote"]).inc();
        let err = match self.shard_writer.write_shard(shard_id, owner_id, points).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if let (true, Some(hh)) = (is_retryable(&err), &self.hinted_handoff) {
            m.point_requests.with_label_values(&["hh"]).inc();
            match hh.write_shard(shard_id, owner_id, points).await {
                Ok(()) if consistency == ConsistencyLevel::Any => return Ok(()),
                Ok(()) => {
                    tracing::debug!(shard_id, owner_id, "write queued for hinted handoff");
                }
                Err(hh_err) => {
                    tracing::warn!(shard_id, owner_id, "hinted handoff failed: {}", hh_err);
                }
            }
        }
        Err(err.into())
    }
}

/// Resolves once the close flag is set.
async fn closed(mut rx: watch::Receiver<bool>) {
    loop {
        let closed = *rx.borrow_and_update();
        if closed {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without closing: never resolves.
            std::future::pending::<()>().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
