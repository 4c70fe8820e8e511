use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::dispatch::Dispatcher;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RequestLabels {
    method: String,
    /// `ok` or the error kind.
    outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PoolLabels {
    uri: String,
    state: PoolStateLabel,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
#[allow(non_camel_case_types)]
enum PoolStateLabel {
    idle,
    in_use,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct LookupLabels {
    result: LookupResult,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
#[allow(non_camel_case_types)]
enum LookupResult {
    hit,
    miss,
}

// ---------------------------------------------------------------------------
// MetricsRegistry
// ---------------------------------------------------------------------------

/// Prometheus metrics for the RPC server, connection pools and caches.
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Mutex<Registry>,
    rpc_requests_total: Family<RequestLabels, Counter>,
    rpc_duration_seconds: Histogram,
    pool_acquire_seconds: Histogram,
    pool_connections: Family<PoolLabels, Gauge>,
    cache_lookups_total: Family<LookupLabels, Counter>,
    start_time: Instant,
    started_at: DateTime<Utc>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let rpc_requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "kvmctl_rpc_requests",
            "RPC requests by method and outcome",
            rpc_requests_total.clone(),
        );

        // 5ms .. ~40s
        let rpc_duration_seconds = Histogram::new(exponential_buckets(0.005, 2.0, 14));
        registry.register(
            "kvmctl_rpc_duration_seconds",
            "RPC handling time in seconds",
            rpc_duration_seconds.clone(),
        );

        // 1ms .. ~32s
        let pool_acquire_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 16));
        registry.register(
            "kvmctl_pool_acquire_seconds",
            "Time spent waiting for a hypervisor connection",
            pool_acquire_seconds.clone(),
        );

        let pool_connections = Family::<PoolLabels, Gauge>::default();
        registry.register(
            "kvmctl_pool_connections",
            "Hypervisor connections by endpoint and state",
            pool_connections.clone(),
        );

        let cache_lookups_total = Family::<LookupLabels, Counter>::default();
        registry.register(
            "kvmctl_cache_lookups",
            "VM info cache lookups by result",
            cache_lookups_total.clone(),
        );

        Self {
            inner: Arc::new(MetricsInner {
                registry: Mutex::new(registry),
                rpc_requests_total,
                rpc_duration_seconds,
                pool_acquire_seconds,
                pool_connections,
                cache_lookups_total,
                start_time: Instant::now(),
                started_at: Utc::now(),
            }),
        }
    }

    pub fn record_request(&self, method: &str, outcome: &str, duration: Duration) {
        self.inner
            .rpc_duration_seconds
            .observe(duration.as_secs_f64());
        self.inner
            .rpc_requests_total
            .get_or_create(&RequestLabels {
                method: method.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
    }

    pub fn record_pool_acquire(&self, waited: Duration) {
        self.inner
            .pool_acquire_seconds
            .observe(waited.as_secs_f64());
    }

    pub fn set_pool_connections(&self, uri: &str, idle: usize, in_use: usize) {
        for (state, n) in [(PoolStateLabel::idle, idle), (PoolStateLabel::in_use, in_use)] {
            self.inner
                .pool_connections
                .get_or_create(&PoolLabels {
                    uri: uri.to_string(),
                    state,
                })
                .set(n as i64);
        }
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        let result = if hit {
            LookupResult::hit
        } else {
            LookupResult::miss
        };
        self.inner
            .cache_lookups_total
            .get_or_create(&LookupLabels { result })
            .inc();
    }

    /// Encode all metrics in OpenMetrics text format.
    pub fn encode_metrics(&self) -> String {
        let mut buf = String::new();
        let registry = self.inner.registry.lock();
        if let Err(e) = encode(&mut buf, &registry) {
            tracing::warn!(error = %e, "failed to encode metrics");
        }
        buf
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

struct MetricsState {
    metrics: MetricsRegistry,
    dispatcher: Arc<Dispatcher>,
}

fn refresh_pool_gauges(state: &MetricsState) {
    for ep in state.dispatcher.endpoint_stats() {
        state
            .metrics
            .set_pool_connections(&ep.uri, ep.pool.idle, ep.pool.in_use);
    }
}

async fn metrics_handler(State(state): State<Arc<MetricsState>>) -> impl IntoResponse {
    refresh_pool_gauges(&state);
    let body = state.metrics.encode_metrics();
    (
        StatusCode::OK,
        [("content-type", "application/openmetrics-text; version=1.0.0; charset=utf-8")],
        body,
    )
}

async fn healthz_handler(State(state): State<Arc<MetricsState>>) -> impl IntoResponse {
    let endpoints = state.dispatcher.endpoint_stats();
    let pools: serde_json::Map<String, serde_json::Value> = endpoints
        .iter()
        .map(|ep| {
            (
                ep.uri.clone(),
                serde_json::json!({
                    "idle": ep.pool.idle,
                    "in_use": ep.pool.in_use,
                    "max": ep.pool.max,
                }),
            )
        })
        .collect();
    let caches: serde_json::Map<String, serde_json::Value> = endpoints
        .iter()
        .map(|ep| {
            (
                ep.uri.clone(),
                serde_json::json!({
                    "entries": ep.cache_entries,
                    "max": ep.cache_capacity,
                    "locked_vms": ep.locked_vms,
                }),
            )
        })
        .collect();

    let status = if state.dispatcher.is_shutting_down() {
        "shutting_down"
    } else {
        "ok"
    };
    let body = serde_json::json!({
        "status": status,
        "pool": pools,
        "cache": caches,
        "started_at": state.metrics.started_at().to_rfc3339(),
        "uptime_seconds": state.metrics.uptime_seconds(),
    });

    (
        StatusCode::OK,
        [("content-type", "application/json")],
        body.to_string(),
    )
}

fn router(metrics: MetricsRegistry, dispatcher: Arc<Dispatcher>) -> Router {
    let state = Arc::new(MetricsState {
        metrics,
        dispatcher,
    });
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

/// Start the metrics HTTP server as a background tokio task.
pub fn start_metrics_server(
    addr: SocketAddr,
    metrics: MetricsRegistry,
    dispatcher: Arc<Dispatcher>,
) -> tokio::task::JoinHandle<()> {
    let app = router(metrics, dispatcher);

    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(addr = %addr, error = %e, "failed to bind metrics server");
                return;
            }
        };
        tracing::info!(addr = %addr, "metrics server listening");
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "metrics server error");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::hypervisor::fake::FakeHypervisor;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_new_registry_names() {
        let reg = MetricsRegistry::new();
        reg.record_request("list_vms", "ok", Duration::from_millis(3));
        reg.record_pool_acquire(Duration::from_millis(1));
        reg.set_pool_connections("qemu:///system", 1, 0);
        reg.record_cache_lookup(true);
        let text = reg.encode_metrics();
        assert!(text.contains("kvmctl_rpc_requests_total"));
        assert!(text.contains("kvmctl_rpc_duration_seconds"));
        assert!(text.contains("kvmctl_pool_acquire_seconds"));
        assert!(text.contains("kvmctl_pool_connections"));
        assert!(text.contains("kvmctl_cache_lookups_total"));
    }

    #[test]
    fn test_request_labels() {
        let reg = MetricsRegistry::new();
        reg.record_request("start_vm", "ok", Duration::from_millis(10));
        reg.record_request("start_vm", "vm_not_found", Duration::from_millis(10));
        let text = reg.encode_metrics();
        assert!(text.contains("method=\"start_vm\""));
        assert!(text.contains("outcome=\"vm_not_found\""));
    }

    #[test]
    fn test_cache_and_pool_labels() {
        let reg = MetricsRegistry::new();
        reg.record_cache_lookup(true);
        reg.record_cache_lookup(false);
        reg.set_pool_connections("qemu:///system", 2, 1);
        let text = reg.encode_metrics();
        assert!(text.contains("result=\"hit\""));
        assert!(text.contains("result=\"miss\""));
        assert!(text.contains("state=\"in_use\""));
    }

    #[test]
    fn test_clone_is_shared() {
        let reg1 = MetricsRegistry::new();
        let reg2 = reg1.clone();
        reg1.record_request("reboot_vm", "ok", Duration::from_millis(1));
        assert!(reg2.encode_metrics().contains("reboot_vm"));
    }

    #[tokio::test]
    async fn test_healthz_reports_pool() {
        let metrics = MetricsRegistry::new();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(Config::default()),
            Arc::new(FakeHypervisor::new()),
            Some(metrics.clone()),
        ));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(metrics, dispatcher);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("\"status\":\"ok\""));
        assert!(response.contains("qemu:///system"));
        assert!(response.contains("\"max\":5"));
        assert!(response.contains("\"max\":50"));
    }
}
