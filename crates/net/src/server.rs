//! Shard service: the server side of the shard transport.
//!
//! Each connection carries a sequence of framed requests. Writes get one
//! response each; map requests get a stream of responses ending with one
//! that carries no data.

use crate::frame::{read_frame, write_message, MessageType};
use crate::wire::{
    MapShardRequest, MapShardResponse, WriteShardRequest, WriteShardResponse, CODE_ERROR, CODE_OK,
};
use crate::TransportError;
use prost::Message;
use std::sync::Arc;
use strata_meta::MetaStore;
use strata_storage::{DataStore, StoreError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

pub struct ShardService {
    meta: Arc<dyn MetaStore>,
    store: Arc<dyn DataStore>,
}

impl std::fmt::Debug for ShardService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardService").finish_non_exhaustive()
    }
}

impl ShardService {
    pub fn new(meta: Arc<dyn MetaStore>, store: Arc<dyn DataStore>) -> Self {
        Self { meta, store }
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        tracing::info!("shard service listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("accept failed: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("set_nodelay failed for {}: {}", peer, e);
            }
            let service = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = service.handle_connection(stream).await {
                    tracing::debug!("connection from {} closed: {}", peer, e);
                }
            });
        }
    }

    /// Serve requests on one connection until EOF or an unknown frame type.
    pub async fn handle_connection<S>(&self, mut stream: S) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        while let Some(frame) = read_frame(&mut stream).await? {
            match MessageType::try_from(frame.msg_type) {
                Ok(MessageType::WriteShardRequest) => {
                    let resp = self.write_shard(&frame.payload).await;
                    write_message(&mut stream, MessageType::WriteShardResponse, &resp).await?;
                }
                Ok(MessageType::MapShardRequest) => {
                    self.map_shard(&frame.payload, &mut stream).await?;
                }
                _ => {
                    tracing::warn!(
                        "unexpected message type {} from peer, closing connection",
                        frame.msg_type
                    );
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Write
    // -----------------------------------------------------------------------

    async fn write_shard(&self, payload: &[u8]) -> WriteShardResponse {
        let _timer = strata_metrics::start_shard_request_timer("write_shard", "inbound");

        let result = match WriteShardRequest::decode(payload) {
            Ok(req) => self.apply_write(&req).await,
            Err(e) => Err(e.to_string()),
        };
        match result {
            Ok(()) => WriteShardResponse {
                code: CODE_OK,
                message: String::new(),
            },
            Err(message) => {
                strata_metrics::metrics()
                    .shard_request_failures
                    .with_label_values(&["write_shard"])
                    .inc();
                tracing::warn!("write_shard failed: {}", message);
                WriteShardResponse {
                    code: CODE_ERROR,
                    message,
                }
            }
        }
    }

    async fn apply_write(&self, req: &WriteShardRequest) -> Result<(), String> {
        let points = req.to_points().map_err(|e| e.to_string())?;
        tracing::debug!(shard_id = req.shard_id, points = points.len(), "write_shard");

        match self.store.write_to_shard(req.shard_id, &points).await {
            Err(StoreError::ShardNotFound(shard_id)) => {
                let owner = self
                    .meta
                    .shard_owner(shard_id)
                    .await
                    .ok_or_else(|| StoreError::ShardNotFound(shard_id).to_string())?;
                self.store
                    .create_shard(&owner.database, &owner.retention_policy, shard_id)
                    .await
                    .map_err(|e| e.to_string())?;
                self.store
                    .write_to_shard(shard_id, &points)
                    .await
                    .map_err(|e| e.to_string())
            }
            other => other.map_err(|e| e.to_string()),
        }
    }

    // -----------------------------------------------------------------------
    // Map
    // -----------------------------------------------------------------------

    async fn map_shard<S>(&self, payload: &[u8], stream: &mut S) -> Result<(), TransportError>
    where
        S: AsyncWrite + Unpin + Send,
    {
        let _timer = strata_metrics::start_shard_request_timer("map_shard", "inbound");

        let req = match MapShardRequest::decode(payload) {
            Ok(req) => req,
            Err(e) => return send_error(stream, e.to_string()).await,
        };
        let chunk_size = usize::try_from(req.chunk_size).unwrap_or(0);
        tracing::debug!(shard_id = req.shard_id, query = %req.query, chunk_size, "map_shard");

        let mut mapper = match self
            .store
            .create_mapper(req.shard_id, &req.query, chunk_size)
            .await
        {
            Ok(mapper) => mapper,
            Err(e) => return send_error(stream, e.to_string()).await,
        };
        if let Err(e) = mapper.open().await {
            return send_error(stream, e.to_string()).await;
        }

        let result = loop {
            match mapper.next_chunk().await {
                Ok(Some(chunk)) => {
                    let data = match chunk.to_json() {
                        Ok(data) => data,
                        Err(e) => break send_error(stream, e.to_string()).await,
                    };
                    let resp = MapShardResponse {
                        code: CODE_OK,
                        message: String::new(),
                        data: Some(data),
                    };
                    if let Err(e) = write_message(stream, MessageType::MapShardResponse, &resp).await {
                        break Err(e);
                    }
                }
                Ok(None) => {
                    let eos = MapShardResponse {
                        code: CODE_OK,
                        message: String::new(),
                        data: None,
                    };
                    break write_message(stream, MessageType::MapShardResponse, &eos).await;
                }
                Err(e) => break send_error(stream, e.to_string()).await,
            }
        };
        mapper.close().await;
        result
    }
}

async fn send_error<S>(stream: &mut S, message: String) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin + Send,
{
    strata_metrics::metrics()
        .shard_request_failures
        .with_label_values(&["map_shard"])
        .inc();
    tracing::warn!("map_shard failed: {}", message);
    let resp = MapShardResponse {
        code: CODE_ERROR,
        message,
        data: None,
    };
    write_message(stream, MessageType::MapShardResponse, &resp).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{read_message, write_frame};
    use crate::wire::WirePoint;
    use strata_common::{FieldValue, Point};
    use strata_meta::{LocalMetaStore, MetaStore, RetentionPolicySpec};
    use strata_storage::{FsyncPolicy, MapperOutput, ShardStore};
    use tempfile::TempDir;
    use tokio::io::duplex;
    use tokio::time::Duration;

    struct Fixture {
        service: Arc<ShardService>,
        store: Arc<ShardStore>,
        shard_id: u64,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let meta = LocalMetaStore::new(1);
        meta.create_node("127.0.0.1:8088").await.unwrap();
        meta.create_database("db").await.unwrap();
        meta.create_retention_policy(
            "db",
            &RetentionPolicySpec {
                name: "rp".into(),
                duration: Duration::ZERO,
                replica_n: 1,
            },
        )
        .await
        .unwrap();
        let group = meta
            .create_shard_group_if_not_exists("db", "rp", 0)
            .await
            .unwrap();
        let store = Arc::new(ShardStore::open(dir.path(), FsyncPolicy::None).unwrap());
        Fixture {
            service: Arc::new(ShardService::new(Arc::new(meta), store.clone())),
            store,
            shard_id: group.shards[0].id,
            _dir: dir,
        }
    }

    fn points(n: i64) -> Vec<Point> {
        (0..n)
            .map(|t| {
                Point::new("cpu", t)
                    .with_tag("host", "a")
                    .with_field("value", FieldValue::Integer(t))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_write_creates_shard_from_meta() {
        let f = fixture().await;
        let resp = f
            .service
            .write_shard(&WriteShardRequest::new(f.shard_id, &points(3)).encode_to_vec())
            .await;
        assert_eq!(resp.code, CODE_OK, "{}", resp.message);
        assert_eq!(f.store.point_count(f.shard_id).await, Some(3));
    }

    #[tokio::test]
    async fn test_write_unknown_shard_is_error_response() {
        let f = fixture().await;
        let resp = f
            .service
            .write_shard(&WriteShardRequest::new(999, &points(1)).encode_to_vec())
            .await;
        assert_eq!(resp.code, CODE_ERROR);
        assert!(resp.message.contains("999"));
    }

    #[tokio::test]
    async fn test_write_invalid_point_is_error_response() {
        let f = fixture().await;
        let req = WriteShardRequest {
            shard_id: f.shard_id,
            points: vec![WirePoint {
                measurement: "cpu".into(),
                tags: Default::default(),
                fields: vec![crate::wire::WireField {
                    name: "v".into(),
                    value: None,
                }],
                time: 0,
            }],
        };
        let resp = f.service.write_shard(&req.encode_to_vec()).await;
        assert_eq!(resp.code, CODE_ERROR);
    }

    #[tokio::test]
    async fn test_map_streams_chunks_then_end() {
        let f = fixture().await;
        f.service
            .write_shard(&WriteShardRequest::new(f.shard_id, &points(5)).encode_to_vec())
            .await;

        let (mut client, server) = duplex(64 * 1024);
        let service = f.service.clone();
        let handle = tokio::spawn(async move { service.handle_connection(server).await });

        let req = MapShardRequest {
            shard_id: f.shard_id,
            query: "cpu".into(),
            chunk_size: 2,
        };
        write_message(&mut client, MessageType::MapShardRequest, &req)
            .await
            .unwrap();

        let mut sizes = Vec::new();
        loop {
            let resp: MapShardResponse = read_message(&mut client, MessageType::MapShardResponse)
                .await
                .unwrap();
            assert_eq!(resp.code, CODE_OK);
            match resp.data {
                Some(data) => sizes.push(MapperOutput::from_json(&data).unwrap().values.len()),
                None => break,
            }
        }
        assert_eq!(sizes, vec![2, 2, 1]);

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_map_missing_shard_sends_error() {
        let f = fixture().await;
        let (mut client, server) = duplex(4096);
        let service = f.service.clone();
        tokio::spawn(async move { service.handle_connection(server).await });

        let req = MapShardRequest {
            shard_id: 12345,
            query: String::new(),
            chunk_size: 0,
        };
        write_message(&mut client, MessageType::MapShardRequest, &req)
            .await
            .unwrap();
        let resp: MapShardResponse = read_message(&mut client, MessageType::MapShardResponse)
            .await
            .unwrap();
        assert_eq!(resp.code, CODE_ERROR);
        assert!(resp.data.is_none());
        assert!(resp.message.contains("shard not found"));
    }

    #[tokio::test]
    async fn test_unknown_type_closes_connection() {
        let f = fixture().await;
        let (mut client, server) = duplex(4096);
        let service = f.service.clone();
        let handle = tokio::spawn(async move { service.handle_connection(server).await });

        // A response type sent as a request is not served either.
        write_frame(&mut client, MessageType::WriteShardResponse, &[])
            .await
            .unwrap();
        handle.await.unwrap().unwrap();
        assert!(read_frame(&mut client).await.unwrap().is_none());
    }
}
