//! Storage for strata data nodes: a per-shard WAL plus an in-memory series
//! index.
//!
//! Points written to a shard are appended to that shard's WAL first (for
//! durability) and then indexed by series key and time (for reads). Shards
//! are rebuilt from their WALs when the store is reopened.

pub mod engine;
pub mod mapper;
pub mod series;
pub mod store;
pub mod wal;

pub use engine::ShardStore;
pub use mapper::{LocalMapper, Mapper, MapperError, MapperOutput, MapperValue};
pub use store::{DataStore, StoreError};
pub use wal::{FsyncPolicy, Wal, WalError};
