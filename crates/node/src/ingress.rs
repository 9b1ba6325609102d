//! HTTP ingress: the client-facing write and query endpoints.
//!
//! - `POST /write?db=<db>&rp=<rp>&consistency=<level>` takes a JSON array
//!   of points and hands it to the points writer. `rp` defaults to the
//!   database's default policy and `consistency` to `one`.
//! - `GET /query?shard=<id>&q=<query>&chunk_size=<n>` runs a mapper over
//!   one shard through the query router and returns its chunks as a JSON
//!   array.
//!
//! Query parameters are taken verbatim; they are not percent-decoded.

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use strata_cluster::{PointsWriter, WriteError, WritePointsRequest};
use strata_common::{ConsistencyLevel, Point, ShardId};
use strata_meta::{MetaError, MetaStore, ShardInfo};
use strata_net::QueryRouter;
use strata_storage::{Mapper, MapperError, MapperOutput};
use tokio::net::TcpListener;

const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub struct Ingress {
    points_writer: PointsWriter,
    query_router: QueryRouter,
    meta: Arc<dyn MetaStore>,
}

impl std::fmt::Debug for Ingress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingress")
            .field("points_writer", &self.points_writer)
            .field("query_router", &self.query_router)
            .finish_non_exhaustive()
    }
}

impl Ingress {
    pub fn new(
        points_writer: PointsWriter,
        query_router: QueryRouter,
        meta: Arc<dyn MetaStore>,
    ) -> Self {
        Self {
            points_writer,
            query_router,
            meta,
        }
    }

    /// Serve HTTP/1.1 until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        tracing::info!("http ingress listening on http://{}", listener.local_addr()?);
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("http accept failed: {}", e);
                    continue;
                }
            };
            let ingress = Arc::clone(&self);
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let ingress = Arc::clone(&ingress);
                    async move { Ok::<_, Infallible>(ingress.handle(req).await) }
                });
                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    tracing::debug!("http connection from {} failed: {}", peer, e);
                }
            });
        }
    }

    async fn handle(&self, req: Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
        let (parts, body) = req.into_parts();
        let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, format!("invalid body: {}", e))
            }
        };
        self.route(&parts.method, parts.uri.path(), parts.uri.query(), &body)
            .await
    }

    pub async fn route(
        &self,
        method: &Method,
        path: &str,
        query: Option<&str>,
        body: &[u8],
    ) -> Response<Full<Bytes>> {
        let params = parse_params(query);
        match (method, path) {
            (&Method::POST, "/write") => self.write(&params, body).await,
            (&Method::GET, "/query") => self.query(&params).await,
            (_, "/write" | "/query") => {
                error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
            }
            _ => error_response(StatusCode::NOT_FOUND, "not found"),
        }
    }

    // -----------------------------------------------------------------------
    // Write
    // -----------------------------------------------------------------------

    async fn write(&self, params: &HashMap<&str, &str>, body: &[u8]) -> Response<Full<Bytes>> {
        let Some(database) = params.get("db").filter(|db| !db.is_empty()) else {
            return error_response(StatusCode::BAD_REQUEST, "database is required");
        };
        let consistency = match params.get("consistency") {
            Some(level) => match level.parse::<ConsistencyLevel>() {
                Ok(level) => level,
                Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
            },
            None => ConsistencyLevel::default(),
        };
        let points: Vec<Point> = match serde_json::from_slice(body) {
            Ok(points) => points,
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, format!("invalid points: {}", e))
            }
        };

        let mut request = WritePointsRequest::new(*database, params.get("rp").copied().unwrap_or(""))
            .with_consistency(consistency);
        request.points = points;

        match self.points_writer.write_points(request).await {
            Ok(()) => {
                let mut resp = Response::new(Full::new(Bytes::new()));
                *resp.status_mut() = StatusCode::NO_CONTENT;
                resp
            }
            Err(e) => {
                tracing::warn!(database = %database, "http write failed: {}", e);
                error_response(write_status(&e), e.to_string())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Query
    // -----------------------------------------------------------------------

    async fn query(&self, params: &HashMap<&str, &str>) -> Response<Full<Bytes>> {
        let Some(shard_id) = params.get("shard").and_then(|s| s.parse::<ShardId>().ok()) else {
            return error_response(StatusCode::BAD_REQUEST, "shard id is required");
        };
        let chunk_size = match params.get("chunk_size").map(|s| s.parse::<usize>()) {
            None => 0,
            Some(Ok(n)) => n,
            Some(Err(e)) => {
                return error_response(StatusCode::BAD_REQUEST, format!("invalid chunk_size: {}", e))
            }
        };
        let query = params.get("q").copied().unwrap_or("");

        let shard = match self.meta.shard_owner(shard_id).await {
            Some(owner) => owner.shard_group.shard(shard_id).cloned(),
            None => None,
        };
        let Some(shard) = shard else {
            return error_response(StatusCode::NOT_FOUND, format!("shard not found: {}", shard_id));
        };

        match self.run_mapper(&shard, query, chunk_size).await {
            Ok(chunks) => match serde_json::to_vec(&chunks) {
                Ok(json) => json_response(StatusCode::OK, json),
                Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            },
            Err(e) => {
                tracing::warn!(shard_id, "http query failed: {}", e);
                let status = match e {
                    MapperError::ShardNotFound(_) => StatusCode::NOT_FOUND,
                    MapperError::Remote { .. } => StatusCode::BAD_GATEWAY,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                error_response(status, e.to_string())
            }
        }
    }

    async fn run_mapper(
        &self,
        shard: &ShardInfo,
        query: &str,
        chunk_size: usize,
    ) -> Result<Vec<MapperOutput>, MapperError> {
        let mut mapper = self
            .query_router
            .create_mapper(shard, query, chunk_size)
            .await?;
        let result = drain(&mut mapper).await;
        mapper.close().await;
        result
    }
}

async fn drain(mapper: &mut Box<dyn Mapper>) -> Result<Vec<MapperOutput>, MapperError> {
    mapper.open().await?;
    let mut chunks = Vec::new();
    while let Some(chunk) = mapper.next_chunk().await? {
        chunks.push(chunk);
    }
    Ok(chunks)
}

fn write_status(err: &WriteError) -> StatusCode {
    match err {
        WriteError::Meta(MetaError::DatabaseNotFound(_))
        | WriteError::Meta(MetaError::RetentionPolicyNotFound(_)) => StatusCode::NOT_FOUND,
        WriteError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn parse_params(query: Option<&str>) -> HashMap<&str, &str> {
    query
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .collect()
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body)));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": message.into() });
    json_response(status, body.to_string().into_bytes())
}
