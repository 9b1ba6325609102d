//! strata-common: shared types for the strata cluster.
//!
//! Provides node and shard identifiers, the `Point` record routed by the
//! write path, consistency levels, and the time-bucketing helpers used when
//! assigning points to shard groups.

pub mod consistency;
pub mod point;

pub use consistency::{ConsistencyLevel, InvalidConsistencyLevel};
pub use point::{FieldValue, Point};

use std::time::Duration;

/// Identifier of a data node in the cluster.
pub type NodeId = u64;

/// Identifier of a shard.
pub type ShardId = u64;

/// Nanoseconds in one hour.
pub const HOUR_NANOS: i64 = 3_600_000_000_000;

/// Nanoseconds in one day.
pub const DAY_NANOS: i64 = 24 * HOUR_NANOS;

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

/// Convert a duration to whole nanoseconds, saturating at `i64::MAX`.
pub fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

/// Truncate `t` (nanoseconds since epoch) down to a multiple of `d`.
///
/// Floors toward negative infinity so that pre-epoch timestamps land in the
/// bucket that starts before them. A zero duration returns `t` unchanged.
/// Timestamps whose floor lies below `i64::MIN` clamp to `i64::MIN`.
pub fn truncate_nanos(t: i64, d: Duration) -> i64 {
    let d = duration_nanos(d);
    if d <= 0 {
        return t;
    }
    t.checked_sub(t.rem_euclid(d)).unwrap_or(i64::MIN)
}

/// First multiple of `d` strictly above `start`, saturating at `i64::MAX`.
///
/// Paired with [`truncate_nanos`] this gives the half-open bucket
/// `[start, end)` holding a timestamp, including the clamped bucket at the
/// bottom of the range.
pub fn bucket_end(start: i64, d: Duration) -> i64 {
    let d = duration_nanos(d);
    if d <= 0 {
        return start;
    }
    start.saturating_add(d - start.rem_euclid(d))
}

/// Wall-clock now, in nanoseconds since the Unix epoch.
pub fn now_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(duration_nanos)
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
