//! Mapper that streams a shard query from another node.
//!
//! Lifecycle: unopened → open (first response buffered) → streaming →
//! exhausted, and closed from any state. The connection carries a single
//! stream and is never returned to the pool.

use crate::frame::{read_message, write_message, MessageType};
use crate::pool::PooledConn;
use crate::wire::{MapShardRequest, MapShardResponse, CODE_OK};
use async_trait::async_trait;
use strata_common::ShardId;
use strata_storage::{Mapper, MapperError, MapperOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapperState {
    Unopened,
    Open,
    Streaming,
    Exhausted,
    Closed,
}

#[derive(Debug)]
pub struct RemoteMapper {
    conn: Option<PooledConn>,
    shard_id: ShardId,
    query: String,
    chunk_size: usize,
    buffered: Option<MapShardResponse>,
    state: MapperState,
}

impl RemoteMapper {
    pub fn new(mut conn: PooledConn, shard_id: ShardId, query: impl Into<String>, chunk_size: usize) -> Self {
        conn.mark_unusable();
        Self {
            conn: Some(conn),
            shard_id,
            query: query.into(),
            chunk_size,
            buffered: None,
            state: MapperState::Unopened,
        }
    }

    pub fn state(&self) -> MapperState {
        self.state
    }

    fn release(&mut self) {
        self.conn = None;
    }

    async fn read_response(&mut self) -> Result<MapShardResponse, MapperError> {
        let conn = self.conn.as_mut().ok_or(MapperError::NotOpen)?;
        let stream = conn.stream()?;
        Ok(read_message(stream, MessageType::MapShardResponse).await?)
    }

    async fn request(&mut self, req: &MapShardRequest) -> Result<MapShardResponse, MapperError> {
        let conn = self.conn.as_mut().ok_or(MapperError::NotOpen)?;
        write_message(conn.stream()?, MessageType::MapShardRequest, req).await?;
        let resp = self.read_response().await?;
        check(&resp)?;
        Ok(resp)
    }
}

fn check(resp: &MapShardResponse) -> Result<(), MapperError> {
    if resp.code != CODE_OK {
        return Err(MapperError::Remote {
            code: resp.code,
            message: resp.message.clone(),
        });
    }
    Ok(())
}

#[async_trait]
impl Mapper for RemoteMapper {
    async fn open(&mut self) -> Result<(), MapperError> {
        let _timer = strata_metrics::start_shard_request_timer("map_shard", "outbound");
        let req = MapShardRequest {
            shard_id: self.shard_id,
            query: self.query.clone(),
            chunk_size: i32::try_from(self.chunk_size).unwrap_or(i32::MAX),
        };

        match self.request(&req).await {
            Ok(resp) => {
                self.buffered = Some(resp);
                self.state = MapperState::Open;
                Ok(())
            }
            Err(e) => {
                strata_metrics::metrics()
                    .shard_request_failures
                    .with_label_values(&["map_shard"])
                    .inc();
                self.release();
                self.state = MapperState::Closed;
                Err(e)
            }
        }
    }

    async fn next_chunk(&mut self) -> Result<Option<MapperOutput>, MapperError> {
        let resp = match self.state {
            MapperState::Unopened | MapperState::Closed => return Err(MapperError::NotOpen),
            MapperState::Exhausted => return Ok(None),
            MapperState::Open => {
                self.state = MapperState::Streaming;
                match self.buffered.take() {
                    Some(resp) => resp,
                    None => self.read_response().await?,
                }
            }
            MapperState::Streaming => self.read_response().await?,
        };

        check(&resp)?;
        // Proto3 cannot tell an absent field from an empty one: both end the stream.
        match resp.data {
            Some(data) if !data.is_empty() => Ok(Some(MapperOutput::from_json(&data)?)),
            _ => {
                self.state = MapperState::Exhausted;
                Ok(None)
            }
        }
    }

    async fn close(&mut self) {
        self.release();
        self.buffered = None;
        self.state = MapperState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::read_frame;
    use crate::pool::{ConnectionPool, PoolConfig};
    use prost::Message;
    use strata_storage::MapperValue;
    use tokio::net::TcpListener;

    fn chunk() -> MapperOutput {
        MapperOutput {
            name: "cpu".into(),
            tags: Default::default(),
            values: vec![MapperValue {
                time: 1,
                value: serde_json::json!(0.5),
            }],
        }
    }

    /// Serves one map request with a chunk followed by `end`.
    async fn serve_once(end: MapShardResponse) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let frame = read_frame(&mut stream).await.unwrap().unwrap();
            let req = MapShardRequest::decode(frame.payload.as_slice()).unwrap();
            assert_eq!(req.shard_id, 1);
            let first = MapShardResponse {
                code: CODE_OK,
                message: String::new(),
                data: Some(chunk().to_json().unwrap()),
            };
            write_message(&mut stream, MessageType::MapShardResponse, &first)
                .await
                .unwrap();
            write_message(&mut stream, MessageType::MapShardResponse, &end)
                .await
                .unwrap();
            // Hold the connection open until the client hangs up.
            let _ = read_frame(&mut stream).await;
        });
        addr
    }

    async fn mapper(addr: String) -> RemoteMapper {
        let config = PoolConfig {
            min_idle: 0,
            ..PoolConfig::default()
        };
        let pool = ConnectionPool::connect(2, addr, &config).await.unwrap();
        RemoteMapper::new(pool.get().await.unwrap(), 1, "cpu", 0)
    }

    #[tokio::test]
    async fn test_empty_data_ends_stream() {
        let addr = serve_once(MapShardResponse {
            code: CODE_OK,
            message: String::new(),
            data: Some(Vec::new()),
        })
        .await;
        let mut mapper = mapper(addr).await;
        mapper.open().await.unwrap();
        assert_eq!(mapper.state(), MapperState::Open);

        assert_eq!(mapper.next_chunk().await.unwrap(), Some(chunk()));
        assert_eq!(mapper.state(), MapperState::Streaming);
        assert_eq!(mapper.next_chunk().await.unwrap(), None);
        assert_eq!(mapper.state(), MapperState::Exhausted);
        assert_eq!(mapper.next_chunk().await.unwrap(), None);

        mapper.close().await;
        assert_eq!(mapper.state(), MapperState::Closed);
        assert_eq!(mapper.next_chunk().await.unwrap_err(), MapperError::NotOpen);
    }

    #[tokio::test]
    async fn test_error_mid_stream() {
        let addr = serve_once(MapShardResponse {
            code: 1,
            message: "disk gone".into(),
            data: None,
        })
        .await;
        let mut mapper = mapper(addr).await;
        mapper.open().await.unwrap();
        assert!(mapper.next_chunk().await.unwrap().is_some());
        let err = mapper.next_chunk().await.unwrap_err();
        assert_eq!(
            err,
            MapperError::Remote {
                code: 1,
                message: "disk gone".into()
            }
        );
    }
}
