//! Fault injection for shard writes.
//!
//! [`ChaosShardWriter`] sits in front of any [`ShardWriter`] and decides,
//! per owner, whether a write is delayed, rejected with a chosen
//! [`WriteShardError`], or forwarded. Faults are either pinned to an owner
//! (`fail_node_with`, `slow_node`) or drawn at random for every owner
//! (`ChaosConfig::failure_rate`).

use crate::shard_writer::{ShardWriter, WriteShardError};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use strata_common::{NodeId, Point, ShardId};
use tokio::sync::RwLock;
use tokio::time::Duration;

#[derive(Debug, Clone)]
pub struct ChaosConfig {
    /// Probability in \[0.0, 1.0\] that any write fails with `random_error`.
    pub failure_rate: f64,
    pub random_error: WriteShardError,
    /// Added to every write, on top of any per-owner delay.
    pub latency: Duration,
    /// Random extra delay in \[0, jitter\].
    pub jitter: Duration,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            random_error: WriteShardError::Transport("chaos: random failure".into()),
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }
}

/// Faults pinned to one owner.
#[derive(Debug, Clone, Default)]
struct OwnerFault {
    error: Option<WriteShardError>,
    delay: Duration,
}

#[derive(Debug)]
struct ChaosState {
    config: ChaosConfig,
    owners: HashMap<NodeId, OwnerFault>,
}

pub struct ChaosShardWriter<W: ShardWriter> {
    inner: W,
    state: RwLock<ChaosState>,
    injected: AtomicU64,
}

impl<W: ShardWriter> std::fmt::Debug for ChaosShardWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosShardWriter")
            .field("injected", &self.injected_failures())
            .finish_non_exhaustive()
    }
}

impl<W: ShardWriter> ChaosShardWriter<W> {
    pub fn new(inner: W, config: ChaosConfig) -> Self {
        Self {
            inner,
            state: RwLock::new(ChaosState {
                config,
                owners: HashMap::new(),
            }),
            injected: AtomicU64::new(0),
        }
    }

    /// Make `node_id` unreachable: writes fail with a retryable transport error.
    pub async fn fail_node(&self, node_id: NodeId) {
        self.fail_node_with(node_id, WriteShardError::Transport("chaos: node down".into()))
            .await;
    }

    /// Fail every write to `node_id` with `error`.
    pub async fn fail_node_with(&self, node_id: NodeId, error: WriteShardError) {
        let mut state = self.state.write().await;
        state.owners.entry(node_id).or_default().error = Some(error);
    }

    /// Delay every write to `node_id` by `delay` before deciding its outcome.
    pub async fn slow_node(&self, node_id: NodeId, delay: Duration) {
        let mut state = self.state.write().await;
        state.owners.entry(node_id).or_default().delay = delay;
    }

    /// Clear every fault pinned to `node_id`.
    pub async fn recover_node(&self, node_id: NodeId) {
        self.state.write().await.owners.remove(&node_id);
    }

    pub async fn set_failure_rate(&self, rate: f64) {
        self.state.write().await.config.failure_rate = rate.clamp(0.0, 1.0);
    }

    pub async fn set_latency(&self, latency: Duration) {
        self.state.write().await.config.latency = latency;
    }

    /// Writes rejected by injected faults so far.
    pub fn injected_failures(&self) -> u64 {
        self.injected.load(Ordering::Relaxed)
    }

    /// Delay to apply and the error to return, if any, for a write to `owner_id`.
    async fn plan(&self, owner_id: NodeId) -> (Duration, Option<WriteShardError>) {
        let state = self.state.read().await;
        let config = &state.config;
        let owner = state.owners.get(&owner_id).cloned().unwrap_or_default();

        let mut rng = rand::thread_rng();
        let jitter = if config.jitter.is_zero() {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.gen_range(0..=config.jitter.as_millis() as u64))
        };
        let delay = config.latency + jitter + owner.delay;

        let error = owner.error.or_else(|| {
            (config.failure_rate > 0.0 && rng.gen_bool(config.failure_rate.min(1.0)))
                .then(|| config.random_error.clone())
        });
        (delay, error)
    }
}

#[async_trait::async_trait]
impl<W: ShardWriter> ShardWriter for ChaosShardWriter<W> {
    async fn write_shard(
        &self,
        shard_id: ShardId,
        owner_id: NodeId,
        points: &[Point],
    ) -> Result<(), WriteShardError> {
        let (delay, error) = self.plan(owner_id).await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = error {
            self.injected.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(shard_id, owner_id, "chaos: injected {}", err);
            return Err(err);
        }
        self.inner.write_shard(shard_id, owner_id, points).await
    }
}
