//! TCP shard transport for strata.
//!
//! Provides:
//! - [`frame`]: `[type][len][payload]` framing of protobuf messages
//! - [`pool`]: bounded per-node connection pools and their registry
//! - [`RemoteShardWriter`]: implements `ShardWriter` over pooled connections
//! - [`RemoteMapper`]: streams a shard query from another node
//! - [`QueryRouter`]: picks a local or remote mapper for a shard
//! - [`ShardService`]: serves shard writes and shard queries to peers

pub mod client;
pub mod frame;
pub mod pool;
pub mod query_router;
pub mod remote_mapper;
pub mod server;
pub mod wire;

pub use client::RemoteShardWriter;
pub use pool::{ConnectionPool, PoolConfig, PoolRegistry, PooledConn};
pub use query_router::{OwnerSelector, QueryRouter, RandomOwner, RoundRobinOwner};
pub use remote_mapper::RemoteMapper;
pub use server::ShardService;

use strata_cluster::WriteShardError;
use strata_common::NodeId;
use strata_storage::MapperError;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timeout")]
    Timeout,
    #[error("connection closed")]
    Closed,
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u64),
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),
    #[error("unexpected message type: expected {expected}, got {got}")]
    UnexpectedMessageType { expected: u8, got: u8 },
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),
}

impl From<TransportError> for WriteShardError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout => WriteShardError::Timeout,
            TransportError::NodeNotFound(id) => WriteShardError::NodeNotFound(id),
            other => WriteShardError::Transport(other.to_string()),
        }
    }
}

impl From<TransportError> for MapperError {
    fn from(e: TransportError) -> Self {
        MapperError::Transport(e.to_string())
    }
}
