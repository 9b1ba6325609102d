//! Write coordination for strata.
//!
//! 1. [`shard_mapper`] assigns each point of a write to a shard, creating
//!    shard groups on demand
//! 2. [`points_writer`] fans each shard's batch out to every owner and
//!    resolves the write against the requested consistency level
//! 3. [`hinted_handoff`] queues writes for owners that were transiently
//!    unreachable, and [`hint_delivery`] replays them later
//!
//! Remote owners are reached through the [`ShardWriter`] capability; the
//! network implementation lives in `strata-net`.

pub mod chaos;
pub mod hint_delivery;
pub mod hinted_handoff;
pub mod points_writer;
pub mod shard_mapper;
pub mod shard_writer;

pub use hint_delivery::{deliver_hints, spawn_hint_delivery_task, DeliveryStats, HintDeliveryConfig};
pub use hinted_handoff::{Hint, HintError, HintedHandoffQueue};
pub use points_writer::{OwnerError, PointsWriter, WriteError, WritePointsRequest};
pub use shard_mapper::{map_shards, ShardMapping};
pub use shard_writer::{is_retryable, ShardWriter, WriteShardError};
