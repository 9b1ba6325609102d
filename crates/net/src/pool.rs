//! Bounded per-node connection pools.
//!
//! Each remote node gets one [`ConnectionPool`]: a few idle TCP connections
//! plus a semaphore capping how many are checked out at once. The
//! [`PoolRegistry`] creates pools on first use, resolving node IDs to hosts
//! through the metadata store.

use crate::TransportError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use strata_common::NodeId;
use strata_meta::MetaStore;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::time::Duration;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections dialed when the pool is created.
    pub min_idle: usize,
    /// Maximum live connections per node.
    pub max_size: usize,
    pub dial_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 1,
            max_size: 3,
            dial_timeout: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionPool
// ---------------------------------------------------------------------------

pub struct ConnectionPool {
    node_id: NodeId,
    addr: String,
    max_size: usize,
    dial_timeout: Duration,
    idle: Mutex<Vec<TcpStream>>,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("node_id", &self.node_id)
            .field("addr", &self.addr)
            .field("idle", &self.idle_count())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Create a pool for `addr`, dialing `min_idle` connections up front.
    pub async fn connect(
        node_id: NodeId,
        addr: impl Into<String>,
        config: &PoolConfig,
    ) -> Result<Arc<Self>, TransportError> {
        let max_size = config.max_size.max(1);
        let pool = Arc::new(Self {
            node_id,
            addr: addr.into(),
            max_size,
            dial_timeout: config.dial_timeout,
            idle: Mutex::new(Vec::with_capacity(max_size)),
            permits: Arc::new(Semaphore::new(max_size)),
        });

        let mut idle = Vec::new();
        for _ in 0..config.min_idle.min(max_size) {
            idle.push(pool.dial().await?);
        }
        if let Ok(mut guard) = pool.idle.lock() {
            guard.extend(idle);
        }
        tracing::debug!(node_id, addr = %pool.addr, "connection pool created");
        Ok(pool)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    /// Connections currently checked out.
    pub fn in_use(&self) -> usize {
        self.max_size - self.permits.available_permits()
    }

    /// Check out a connection, waiting while `max_size` are in use.
    pub async fn get(self: &Arc<Self>) -> Result<PooledConn, TransportError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| TransportError::Closed)?;

        let reused = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        let stream = match reused {
            Some(stream) => stream,
            None => self.dial().await?,
        };
        Ok(PooledConn {
            stream: Some(stream),
            pool: Arc::clone(self),
            usable: true,
            _permit: permit,
        })
    }

    async fn dial(&self) -> Result<TcpStream, TransportError> {
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn put_back(&self, stream: TcpStream) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(stream);
        }
    }
}

// ---------------------------------------------------------------------------
// PooledConn
// ---------------------------------------------------------------------------

/// A checked-out connection. Returns to its pool on drop unless marked
/// unusable.
pub struct PooledConn {
    stream: Option<TcpStream>,
    pool: Arc<ConnectionPool>,
    usable: bool,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("node_id", &self.pool.node_id)
            .field("usable", &self.usable)
            .finish_non_exhaustive()
    }
}

impl PooledConn {
    pub fn node_id(&self) -> NodeId {
        self.pool.node_id
    }

    /// Close the connection on drop instead of returning it.
    pub fn mark_unusable(&mut self) {
        self.usable = false;
    }

    pub fn is_usable(&self) -> bool {
        self.usable
    }

    pub fn stream(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }

    /// Send one request and read its response.
    ///
    /// The connection stays unusable until the exchange completes, so an
    /// exchange that fails or is abandoned midway never returns a
    /// half-read stream to the pool.
    pub async fn round_trip<Req, Resp>(
        &mut self,
        req_type: crate::frame::MessageType,
        req: &Req,
        resp_type: crate::frame::MessageType,
    ) -> Result<Resp, TransportError>
    where
        Req: prost::Message,
        Resp: prost::Message + Default,
    {
        self.usable = false;
        let stream = self.stream()?;
        crate::frame::write_message(stream, req_type, req).await?;
        let resp = crate::frame::read_message(stream, resp_type).await?;
        self.usable = true;
        Ok(resp)
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if self.usable {
                self.pool.put_back(stream);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// PoolRegistry
// ---------------------------------------------------------------------------

/// Node ID → connection pool, created on first use.
pub struct PoolRegistry {
    meta: Arc<dyn MetaStore>,
    config: PoolConfig,
    pools: RwLock<HashMap<NodeId, Arc<ConnectionPool>>>,
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PoolRegistry {
    pub fn new(meta: Arc<dyn MetaStore>, config: PoolConfig) -> Self {
        Self {
            meta,
            config,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Check out a connection to `node_id`.
    pub async fn dial(&self, node_id: NodeId) -> Result<PooledConn, TransportError> {
        self.pool(node_id).await?.get().await
    }

    /// The pool for `node_id`, creating it if needed.
    ///
    /// Dialing happens outside the registry lock so a node that never
    /// answers only stalls its own callers. When two callers race to create
    /// the same pool, the first insert wins and the other pool is dropped.
    pub async fn pool(&self, node_id: NodeId) -> Result<Arc<ConnectionPool>, TransportError> {
        if let Some(pool) = self.pools.read().await.get(&node_id) {
            return Ok(Arc::clone(pool));
        }

        let node = self
            .meta
            .node(node_id)
            .await
            .ok_or(TransportError::NodeNotFound(node_id))?;
        let pool = ConnectionPool::connect(node_id, node.host, &self.config).await?;

        let mut pools = self.pools.write().await;
        Ok(Arc::clone(pools.entry(node_id).or_insert(pool)))
    }

    /// Drop the pool for `node_id`; the next dial creates a fresh one.
    pub async fn remove(&self, node_id: NodeId) {
        self.pools.write().await.remove(&node_id);
    }

    pub async fn len(&self) -> usize {
        self.pools.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pools.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_meta::LocalMetaStore;
    use tokio::net::TcpListener;

    /// Accepts connections forever, counting them.
    async fn listener() -> (String, Arc<std::sync::atomic::AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                held.push(stream);
            }
        });
        (addr, accepted)
    }

    #[tokio::test]
    async fn test_min_idle_dialed_eagerly() {
        let (addr, _) = listener().await;
        let pool = ConnectionPool::connect(2, addr, &PoolConfig::default())
            .await
            .unwrap();
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_connection_returns_on_drop() {
        let (addr, accepted) = listener().await;
        let pool = ConnectionPool::connect(2, addr, &PoolConfig::default())
            .await
            .unwrap();

        let conn = pool.get().await.unwrap();
        assert_eq!(pool.idle_count(), 0);
        drop(conn);
        assert_eq!(pool.idle_count(), 1);

        // Reused, not redialed.
        let _conn = pool.get().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unusable_connection_is_discarded() {
        let (addr, _) = listener().await;
        let pool = ConnectionPool::connect(2, addr, &PoolConfig::default())
            .await
            .unwrap();
        let mut conn = pool.get().await.unwrap();
        conn.mark_unusable();
        drop(conn);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_checkouts_bounded_by_max_size() {
        let (addr, _) = listener().await;
        let config = PoolConfig {
            min_idle: 0,
            max_size: 2,
            dial_timeout: Duration::from_secs(1),
        };
        let pool = ConnectionPool::connect(2, addr, &config).await.unwrap();
        let a = pool.get().await.unwrap();
        let _b = pool.get().await.unwrap();
        assert_eq!(pool.in_use(), 2);

        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.get()).await;
        assert!(blocked.is_err(), "third checkout should wait");

        drop(a);
        let c = tokio::time::timeout(Duration::from_millis(500), pool.get()).await;
        assert!(c.is_ok());
    }

    #[tokio::test]
    async fn test_registry_reuses_pools() {
        let (addr, _) = listener().await;
        let meta = LocalMetaStore::new(1);
        let node = meta.create_node(&addr).await.unwrap();
        let registry = PoolRegistry::new(Arc::new(meta), PoolConfig::default());

        let first = registry.pool(node.id).await.unwrap();
        let second = registry.pool(node.id).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len().await, 1);

        registry.remove(node.id).await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_registry_concurrent_creation_shares_one_pool() {
        let (addr, _) = listener().await;
        let meta = LocalMetaStore::new(1);
        let node = meta.create_node(&addr).await.unwrap();
        let node_id = node.id;
        let registry = Arc::new(PoolRegistry::new(Arc::new(meta), PoolConfig::default()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.pool(node_id).await.unwrap() })
            })
            .collect();
        let mut pools = Vec::new();
        for handle in handles {
            pools.push(handle.await.unwrap());
        }
        let kept = registry.pool(node_id).await.unwrap();
        assert!(pools.iter().all(|p| Arc::ptr_eq(p, &kept)));
        assert_eq!(registry.len().await, 1);
    }

    /// A listener whose accept backlog is full, so new dials hang in SYN.
    async fn saturated_listener() -> (String, TcpListener, Vec<TcpStream>) {
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(0).unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut held = Vec::new();
        for _ in 0..64 {
            match tokio::time::timeout(Duration::from_millis(100), TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => held.push(stream),
                _ => break,
            }
        }
        (addr, listener, held)
    }

    #[tokio::test]
    async fn test_stuck_dial_does_not_block_other_nodes() {
        let (stuck_addr, _stuck, _held) = saturated_listener().await;
        let (healthy_addr, _) = listener().await;

        let meta = LocalMetaStore::new(1);
        let stuck = meta.create_node(&stuck_addr).await.unwrap();
        let healthy = meta.create_node(&healthy_addr).await.unwrap();
        let registry = Arc::new(PoolRegistry::new(
            Arc::new(meta),
            PoolConfig {
                min_idle: 1,
                max_size: 1,
                dial_timeout: Duration::from_secs(2),
            },
        ));

        let blocked = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.pool(stuck.id).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let start = tokio::time::Instant::now();
        registry.pool(healthy.id).await.unwrap();
        assert!(
            start.elapsed() < Duration::from_millis(500),
            "healthy node waited {:?} behind a stuck dial",
            start.elapsed()
        );
        blocked.abort();
    }

    #[tokio::test]
    async fn test_registry_unknown_node() {
        let registry = PoolRegistry::new(Arc::new(LocalMetaStore::new(1)), PoolConfig::default());
        let err = registry.dial(42).await.unwrap_err();
        assert!(matches!(err, TransportError::NodeNotFound(42)));
    }

    #[tokio::test]
    async fn test_dial_refused_is_io_error() {
        // Bind then drop to get a port nothing listens on.
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().to_string()
        };
        let err = ConnectionPool::connect(2, addr, &PoolConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }
}
