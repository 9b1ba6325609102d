//! strata-node: entry point for a strata data node.
//!
//! Loads config, seeds the local meta store with the static membership,
//! opens the shard store, wires the points writer and query router over the
//! pooled shard transport, then serves the shard service on `listen` and the
//! HTTP write/query ingress on `http_listen`.

mod ingress;

use ingress::Ingress;
use std::sync::Arc;
use strata_cluster::{spawn_hint_delivery_task, HintDeliveryConfig, HintedHandoffQueue, PointsWriter};
use strata_meta::{LocalMetaStore, NodeInfo};
use strata_net::{PoolConfig, PoolRegistry, QueryRouter, RemoteShardWriter, ShardService};
use strata_storage::{FsyncPolicy, ShardStore};
use tokio::net::TcpListener;
use tokio::time::Duration;

const BATCH_SYNC_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    strata_metrics::init_tracing();

    // First CLI arg is the YAML config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    let config = match strata_config::load_from_file(std::path::Path::new(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                "failed to load config from {}: {}, using defaults",
                config_path,
                e
            );
            strata_config::load_from_str("listen: \"127.0.0.1:8088\"\nnode_id: 1\n")?
        }
    };
    tracing::info!("node {} listening on {}", config.node_id, config.listen);

    // Meta store seeded from static membership
    let meta = Arc::new(LocalMetaStore::new(config.node_id));
    if config.nodes.is_empty() {
        meta.add_node(NodeInfo {
            id: config.node_id,
            host: config.listen.to_string(),
        })
        .await?;
    }
    for peer in &config.nodes {
        meta.add_node(NodeInfo {
            id: peer.id,
            host: peer.host.clone(),
        })
        .await?;
    }

    // Shard store
    let fsync = FsyncPolicy::from_str_config(&config.storage.fsync);
    std::fs::create_dir_all(&config.storage.data_dir)?;
    let store = Arc::new(ShardStore::open(&config.storage.data_dir, fsync)?);

    // Transport
    let pools = Arc::new(PoolRegistry::new(
        meta.clone(),
        PoolConfig {
            min_idle: config.cluster.min_pool_connections,
            max_size: config.cluster.max_pool_connections,
            ..PoolConfig::default()
        },
    ));
    let remote_writer = Arc::new(RemoteShardWriter::new(
        pools.clone(),
        config.cluster.shard_writer_timeout(),
    ));

    // Points writer, with hinted handoff if enabled
    let mut points_writer = PointsWriter::new(
        meta.clone(),
        store.clone(),
        remote_writer.clone(),
        config.cluster.write_timeout(),
    );
    let hint_queue = if config.hinted_handoff.enabled {
        let queue = Arc::new(HintedHandoffQueue::open_with_fsync(
            &config.hinted_handoff_dir(),
            config.hinted_handoff.max_hints_per_node,
            FsyncPolicy::from_str_config(&config.hinted_handoff.fsync),
        )?);
        points_writer = points_writer.with_hinted_handoff(queue.clone());
        spawn_hint_delivery_task(
            queue.clone(),
            meta.clone(),
            remote_writer.clone(),
            HintDeliveryConfig {
                check_interval: Duration::from_secs(config.hinted_handoff.retry_interval_secs.max(1)),
                max_hints_per_cycle: config.hinted_handoff.max_hints_per_cycle,
            },
        );
        Some(queue)
    } else {
        None
    };

    let query_router = QueryRouter::new(config.node_id, store.clone(), pools)
        .with_force_remote(config.cluster.force_remote_mapping);

    // Periodic fsync for whichever logs run in batch mode
    if fsync == FsyncPolicy::Batch {
        let store = store.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(BATCH_SYNC_INTERVAL);
            loop {
                tick.tick().await;
                if let Err(e) = store.sync_all().await {
                    tracing::warn!("shard sync failed: {}", e);
                }
            }
        });
    }
    if let Some(queue) = &hint_queue {
        if queue.fsync_policy().await == FsyncPolicy::Batch {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(BATCH_SYNC_INTERVAL);
                loop {
                    tick.tick().await;
                    if let Err(e) = queue.sync().await {
                        tracing::warn!("hint queue sync failed: {}", e);
                    }
                }
            });
        }
    }

    // Client-facing HTTP ingress
    let http_listener = TcpListener::bind(config.http_listen).await?;
    let ingress = Arc::new(Ingress::new(points_writer.clone(), query_router, meta.clone()));
    tokio::spawn(async move {
        if let Err(e) = ingress.serve(http_listener).await {
            tracing::warn!("http ingress failed: {}", e);
        }
    });

    // Metrics HTTP server if configured
    if let Some(metrics_port) = config.metrics_port {
        let metrics_addr = std::net::SocketAddr::from(([0, 0, 0, 0], metrics_port));
        tokio::spawn(async move {
            if let Err(e) = strata_metrics::serve_metrics(metrics_addr).await {
                tracing::warn!("metrics server failed: {}", e);
            }
        });
    }

    // Serve until Ctrl+C
    let listener = TcpListener::bind(config.listen).await?;
    let service = Arc::new(ShardService::new(meta, store.clone()));
    tokio::select! {
        result = service.serve(listener) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C, shutting down");
        }
    }

    points_writer.close();
    store.sync_all().await?;
    if let Some(queue) = hint_queue {
        queue.sync().await?;
    }
    Ok(())
}
