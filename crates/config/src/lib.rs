//! Configuration schema and loader for strata data nodes.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use strata_common::NodeId;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address the shard service listens on.
    pub listen: SocketAddr,

    /// This node's ID. Must appear in `nodes` when `nodes` is non-empty.
    pub node_id: NodeId,

    /// Static cluster membership used to seed the local meta store.
    #[serde(default)]
    pub nodes: Vec<PeerConfig>,

    /// Write coordination and transport settings.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Hinted handoff settings.
    #[serde(default)]
    pub hinted_handoff: HintedHandoffConfig,

    /// Storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,

    /// Address of the client-facing HTTP write and query endpoints.
    #[serde(default = "default_http_listen")]
    pub http_listen: SocketAddr,
}

/// A cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: NodeId,
    /// Dialable `host:port` of the peer's shard service.
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Per-shard deadline for collecting owner acknowledgements.
    #[serde(default = "default_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Deadline applied to each remote shard request.
    #[serde(default = "default_timeout_ms")]
    pub shard_writer_timeout_ms: u64,

    /// Connections dialed eagerly when a node's pool is created.
    #[serde(default = "default_min_pool_connections")]
    pub min_pool_connections: usize,

    /// Upper bound on live connections per remote node.
    #[serde(default = "default_max_pool_connections")]
    pub max_pool_connections: usize,

    /// Route every shard query over the network, even for local shards.
    #[serde(default)]
    pub force_remote_mapping: bool,
}

impl ClusterConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn shard_writer_timeout(&self) -> Duration {
        Duration::from_millis(self.shard_writer_timeout_ms)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: default_timeout_ms(),
            shard_writer_timeout_ms: default_timeout_ms(),
            min_pool_connections: default_min_pool_connections(),
            max_pool_connections: default_max_pool_connections(),
            force_remote_mapping: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HintedHandoffConfig {
    /// Whether failed remote writes are queued for later delivery.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Queue directory. Defaults to `<storage.data_dir>/hh`.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Maximum queued hints per target node.
    #[serde(default = "default_max_hints_per_node")]
    pub max_hints_per_node: usize,

    /// Delivery check interval in seconds.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// Maximum hints to attempt per delivery cycle.
    #[serde(default = "default_max_hints_per_cycle")]
    pub max_hints_per_cycle: usize,

    /// Fsync policy for the hint log: "always", "batch", "none".
    #[serde(default = "default_hint_fsync")]
    pub fsync: String,
}

impl Default for HintedHandoffConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            max_hints_per_node: default_max_hints_per_node(),
            retry_interval_secs: default_retry_interval_secs(),
            max_hints_per_cycle: default_max_hints_per_cycle(),
            fsync: default_hint_fsync(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for shard WALs.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Fsync policy: "always", "batch", "none".
    #[serde(default = "default_fsync")]
    pub fsync: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            fsync: default_fsync(),
        }
    }
}

// --- Defaults ---

fn default_http_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8086))
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_min_pool_connections() -> usize {
    1
}
fn default_max_pool_connections() -> usize {
    3
}
fn default_true() -> bool {
    true
}
fn default_max_hints_per_node() -> usize {
    100_000
}
fn default_retry_interval_secs() -> u64 {
    1
}
fn default_max_hints_per_cycle() -> usize {
    1000
}
fn default_hint_fsync() -> String {
    "always".to_string()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_fsync() -> String {
    "batch".to_string()
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl NodeConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.write_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "cluster.write_timeout_ms must be > 0".into(),
            ));
        }
        if self.cluster.shard_writer_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "cluster.shard_writer_timeout_ms must be > 0".into(),
            ));
        }
        if self.cluster.max_pool_connections == 0 {
            return Err(ConfigError::Invalid(
                "cluster.max_pool_connections must be > 0".into(),
            ));
        }
        if self.cluster.min_pool_connections > self.cluster.max_pool_connections {
            return Err(ConfigError::Invalid(format!(
                "cluster.min_pool_connections ({}) must be <= cluster.max_pool_connections ({})",
                self.cluster.min_pool_connections, self.cluster.max_pool_connections
            )));
        }
        if self.http_listen == self.listen {
            return Err(ConfigError::Invalid(format!(
                "http_listen {} collides with listen",
                self.http_listen
            )));
        }
        if self.hinted_handoff.max_hints_per_node == 0 {
            return Err(ConfigError::Invalid(
                "hinted_handoff.max_hints_per_node must be > 0".into(),
            ));
        }
        if !self.nodes.is_empty() && !self.nodes.iter().any(|n| n.id == self.node_id) {
            return Err(ConfigError::Invalid(format!(
                "node_id {} is not listed in nodes",
                self.node_id
            )));
        }
        let mut ids: Vec<NodeId> = self.nodes.iter().map(|n| n.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.nodes.len() {
            return Err(ConfigError::Invalid("nodes contains duplicate ids".into()));
        }
        Ok(())
    }

    /// Hinted handoff queue directory.
    pub fn hinted_handoff_dir(&self) -> PathBuf {
        self.hinted_handoff
            .dir
            .clone()
            .unwrap_or_else(|| self.storage.data_dir.join("hh"))
    }
}

/// Load a `NodeConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `NodeConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}
