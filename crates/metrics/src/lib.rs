//! Metrics and tracing setup for strata.
//!
//! Provides a global [`NodeMetrics`] singleton backed by the `prometheus`
//! crate, plus an optional lightweight HTTP server for Prometheus scraping.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

static METRICS: OnceLock<NodeMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static NodeMetrics {
    METRICS.get_or_init(NodeMetrics::new)
}

/// All Prometheus metrics for a strata node.
pub struct NodeMetrics {
    pub registry: Registry,

    // ── Points writer ──
    pub write_requests: IntCounter,
    pub points_written: IntCounter,
    /// Points dispatched per owner, by destination (local/remote/hh).
    pub point_requests: IntCounterVec,
    /// Shard write outcomes: ok/partial/timeout/error.
    pub write_outcomes: IntCounterVec,
    pub write_latency_secs: HistogramVec,

    // ── Shard transport ──
    pub shard_requests: IntCounterVec,
    pub shard_request_failures: IntCounterVec,
    pub shard_request_latency_secs: HistogramVec,

    // ── Hinted handoff ──
    pub hints_queued: IntCounter,
    pub hints_delivered: IntCounter,
    pub hints_dropped: IntCounter,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMetrics").finish_non_exhaustive()
    }
}

/// Default histogram buckets (seconds).
const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help)).expect("counter opts")
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels).expect("counter vec opts")
}

fn histogram_vec(name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    HistogramVec::new(
        HistogramOpts::new(name, help).buckets(LATENCY_BUCKETS.to_vec()),
        labels,
    )
    .expect("histogram opts")
}

impl NodeMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let write_requests = counter("strata_write_requests_total", "Write points requests");
        let points_written = counter(
            "strata_points_written_total",
            "Points received by the points writer",
        );
        let point_requests = counter_vec(
            "strata_point_requests_total",
            "Point batches dispatched to shard owners, by destination",
            &["destination"],
        );
        let write_outcomes = counter_vec(
            "strata_shard_writes_total",
            "Shard write outcomes",
            &["outcome"],
        );
        let write_latency_secs = histogram_vec(
            "strata_write_latency_seconds",
            "Write points latency in seconds",
            &["consistency"],
        );

        let shard_requests = counter_vec(
            "strata_shard_requests_total",
            "Shard transport requests, by type and direction",
            &["request_type", "direction"],
        );
        let shard_request_failures = counter_vec(
            "strata_shard_request_failures_total",
            "Failed shard transport requests, by type",
            &["request_type"],
        );
        let shard_request_latency_secs = histogram_vec(
            "strata_shard_request_latency_seconds",
            "Shard transport latency in seconds",
            &["request_type", "direction"],
        );

        let hints_queued = counter(
            "strata_hints_queued_total",
            "Writes queued for hinted handoff",
        );
        let hints_delivered = counter(
            "strata_hints_delivered_total",
            "Hints successfully delivered",
        );
        let hints_dropped = counter(
            "strata_hints_dropped_total",
            "Hints dropped after a non-retryable failure",
        );

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(write_requests.clone()),
            Box::new(points_written.clone()),
            Box::new(point_requests.clone()),
            Box::new(write_outcomes.clone()),
            Box::new(write_latency_secs.clone()),
            Box::new(shard_requests.clone()),
            Box::new(shard_request_failures.clone()),
            Box::new(shard_request_latency_secs.clone()),
            Box::new(hints_queued.clone()),
            Box::new(hints_delivered.clone()),
            Box::new(hints_dropped.clone()),
        ];
        for collector in collectors {
            registry.register(collector).expect("register metric");
        }

        Self {
            registry,
            write_requests,
            points_written,
            point_requests,
            write_outcomes,
            write_latency_secs,
            shard_requests,
            shard_request_failures,
            shard_request_latency_secs,
            hints_queued,
            hints_delivered,
            hints_dropped,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&m.registry.gather(), &mut buf)
        .expect("prometheus text encoding");
    String::from_utf8(buf).expect("prometheus output is valid UTF-8")
}

/// Helper: start a write latency timer. Records elapsed time on drop.
pub fn start_write_timer(consistency: &str) -> prometheus::HistogramTimer {
    metrics()
        .write_latency_secs
        .with_label_values(&[consistency])
        .start_timer()
}

/// Helper: count a shard transport request and start its latency timer.
pub fn start_shard_request_timer(request_type: &str, direction: &str) -> prometheus::HistogramTimer {
    let m = metrics();
    m.shard_requests
        .with_label_values(&[request_type, direction])
        .inc();
    m.shard_request_latency_secs
        .with_label_values(&[request_type, direction])
        .start_timer()
}

// ────────────────────────── Metrics HTTP server ──────────────────────────

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn metrics_handler(
    _req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let body = encode_metrics();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .expect("valid HTTP response"))
}

/// Serve Prometheus metrics on the given address (`GET /metrics`).
///
/// This spawns a lightweight HTTP/1.1 server. Call from a `tokio::spawn`.
pub async fn serve_metrics(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::debug!("metrics connection error: {}", e);
            }
        });
    }
}

// ────────────────────────── Tests ──────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Histogram;

    #[test]
    fn test_metrics_init_and_increment() {
        let m = metrics();

        let before = m.write_requests.get();
        m.write_requests.inc();
        m.write_requests.inc();
        assert_eq!(m.write_requests.get(), before + 2);

        let local = m.point_requests.with_label_values(&["local"]);
        let before = local.get();
        local.inc();
        assert_eq!(local.get(), before + 1);
    }

    #[test]
    fn test_encode_metrics_format() {
        metrics().hints_queued.inc();
        metrics().write_outcomes.with_label_values(&["ok"]).inc();

        let output = encode_metrics();
        assert!(output.contains("strata_hints_queued_total"));
        assert!(output.contains("strata_shard_writes_total"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_shard_request_timer_records() {
        let h: Histogram = metrics()
            .shard_request_latency_secs
            .with_label_values(&["test_request", "outbound"]);
        let before = h.get_sample_count();
        {
            let _timer = start_shard_request_timer("test_request", "outbound");
        }
        assert_eq!(h.get_sample_count(), before + 1);
        assert!(
            metrics()
                .shard_requests
                .with_label_values(&["test_request", "outbound"])
                .get()
                >= 1
        );
    }
}
