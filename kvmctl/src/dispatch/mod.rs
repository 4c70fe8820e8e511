//! Request routing, per-VM serialization and endpoint bookkeeping.
//!
//! Every mutating call runs the same sequence: take the VM lock, take a
//! pooled connection, execute, invalidate the VM's cache entry, release the
//! connection, release the lock. Waiting for the lock or a connection is
//! abandoned with [`Error::ShuttingDown`] once shutdown begins.

mod handlers;
pub mod params;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use kvmctl_protocol::{
    methods, CreateVmParams, InitializeResult, ListVmsParams, Request, Response, ServerInfo,
    StopVmParams, ToolCallParams, VmActionResult, VmNameParams, VncPortsParams, PROTOCOL_VERSION,
    SERVER_NAME,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::cache::InfoCache;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::hypervisor::Connector;
use crate::locks::{VmLockGuard, VmLocks};
use crate::metrics::MetricsRegistry;
use crate::pool::{ConnectionPool, PoolStats, PooledConnection};

use handlers::{settle, Mutation};

/// Upper bound on distinct hypervisor URIs a client can open.
pub const MAX_ENDPOINTS: usize = 16;

/// Occupancy snapshot of one endpoint, for `/healthz` and the pool gauges.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub uri: String,
    pub pool: PoolStats,
    pub cache_entries: usize,
    pub cache_capacity: usize,
    pub locked_vms: usize,
}

/// Pool, cache and VM locks for one hypervisor URI.
pub struct Endpoint {
    pub uri: String,
    pub pool: ConnectionPool,
    pub cache: InfoCache,
    pub locks: VmLocks,
}

impl Endpoint {
    fn new(
        uri: &str,
        config: &Config,
        connector: Arc<dyn Connector>,
        metrics: Option<MetricsRegistry>,
    ) -> Self {
        let mut cache = InfoCache::new(config.cache.max_size, config.cache.ttl());
        if let Some(m) = &metrics {
            cache = cache.with_metrics(m.clone());
        }
        Self {
            uri: uri.to_string(),
            pool: ConnectionPool::new(uri, &config.pool, connector, metrics),
            cache,
            locks: VmLocks::new(),
        }
    }

    fn stats(&self) -> EndpointStats {
        EndpointStats {
            uri: self.uri.clone(),
            pool: self.pool.stats(),
            cache_entries: self.cache.len(),
            cache_capacity: self.cache.max_size(),
            locked_vms: self.locks.active(),
        }
    }
}

pub struct Dispatcher {
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
    endpoints: Mutex<HashMap<String, Arc<Endpoint>>>,
    shutdown: watch::Sender<bool>,
    metrics: Option<MetricsRegistry>,
}

impl Dispatcher {
    /// The endpoint for the configured default URI exists from the start;
    /// no connection is opened until first use.
    pub fn new(
        config: Arc<Config>,
        connector: Arc<dyn Connector>,
        metrics: Option<MetricsRegistry>,
    ) -> Self {
        let default = Endpoint::new(
            &config.hypervisor.uri,
            &config,
            Arc::clone(&connector),
            metrics.clone(),
        );
        let mut endpoints = HashMap::new();
        endpoints.insert(config.hypervisor.uri.clone(), Arc::new(default));
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            connector,
            endpoints: Mutex::new(endpoints),
            shutdown,
            metrics,
        }
    }

    pub fn default_uri(&self) -> &str {
        &self.config.hypervisor.uri
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Endpoint for `uri`, or the default one. Created on first use.
    pub fn endpoint(&self, uri: Option<&str>) -> Result<Arc<Endpoint>> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        let uri = params::connection_uri(uri)?.unwrap_or(self.default_uri());
        let mut endpoints = self.endpoints.lock();
        if let Some(ep) = endpoints.get(uri) {
            return Ok(Arc::clone(ep));
        }
        if endpoints.len() >= MAX_ENDPOINTS {
            return Err(Error::validation(format!(
                "too many hypervisor connections open (max {MAX_ENDPOINTS})"
            )));
        }
        info!(uri, "opening hypervisor endpoint");
        let ep = Arc::new(Endpoint::new(
            uri,
            &self.config,
            Arc::clone(&self.connector),
            self.metrics.clone(),
        ));
        endpoints.insert(uri.to_string(), Arc::clone(&ep));
        Ok(ep)
    }

    /// Per-endpoint occupancy, sorted by URI.
    pub fn endpoint_stats(&self) -> Vec<EndpointStats> {
        let mut stats: Vec<_> = self.endpoints.lock().values().map(|ep| ep.stats()).collect();
        stats.sort_by(|a, b| a.uri.cmp(&b.uri));
        stats
    }

    /// Connect to the default hypervisor and count its domains.
    pub async fn probe(&self) -> Result<usize> {
        let ep = self.endpoint(None)?;
        let mut conn = self.acquire(&ep).await?;
        let listed = conn.list_domains().await;
        settle(conn, listed).map(|names| names.len())
    }

    /// Stop admitting work. Lock and connection waits still pending fail with
    /// [`Error::ShuttingDown`].
    pub fn begin_shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            info!("dispatcher shutting down");
        }
    }

    /// Close every pool (waiting for checked-out connections) and drop all
    /// cached state.
    pub async fn close(&self) {
        self.begin_shutdown();
        let endpoints: Vec<_> = self.endpoints.lock().values().cloned().collect();
        for ep in endpoints {
            ep.pool.shutdown().await;
            ep.cache.clear();
        }
    }

    /// Run `fut`, giving up with [`Error::ShuttingDown`] only if it is still
    /// pending once shutdown begins. Uncontended waits always succeed.
    async fn interruptible<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let mut rx = self.shutdown.subscribe();
        tokio::select! {
            biased;
            res = fut => res,
            _ = rx.wait_for(|stopping| *stopping) => Err(Error::ShuttingDown),
        }
    }

    pub(crate) async fn acquire(&self, ep: &Endpoint) -> Result<PooledConnection> {
        self.interruptible(ep.pool.acquire()).await
    }

    async fn lock_vm(&self, ep: &Endpoint, name: &str) -> Result<VmLockGuard> {
        self.interruptible(async { Ok(ep.locks.lock(name).await) })
            .await
    }

    // -----------------------------------------------------------------------
    // Request handling
    // -----------------------------------------------------------------------

    /// Handle one request. Returns `None` for notifications.
    pub async fn handle(&self, req: Request) -> Option<Response> {
        let started = Instant::now();
        let label = metric_label(&req.method, &req.params);
        let result = self.call(&req.method, req.params).await;

        let elapsed = started.elapsed();
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        if let Some(m) = &self.metrics {
            m.record_request(label, outcome, elapsed);
        }
        if let Err(e @ (Error::Internal(_) | Error::Hypervisor(_) | Error::ConnectionBroken { .. })) =
            &result
        {
            warn!(method = label, error = %e, "request failed");
        }
        debug!(
            method = label,
            outcome,
            elapsed_ms = elapsed.as_millis() as u64,
            "request handled"
        );

        let id = req.id?;
        Some(match result {
            Ok(value) => Response::success(id, value),
            Err(e) => Response::failure(id, e.to_rpc()),
        })
    }

    /// Run `method` and return its JSON result.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            methods::INITIALIZE => Ok(serde_json::to_value(initialize_result())?),
            methods::TOOLS_CALL => {
                let call: ToolCallParams = params::parse(params)?;
                self.route(&call.name, call.arguments).await
            }
            other => self.route(other, params).await,
        }
    }

    async fn route(&self, tool: &str, args: Value) -> Result<Value> {
        match tool {
            methods::LIST_VMS => {
                let p: ListVmsParams = params::parse(args)?;
                let ep = self.endpoint(p.connection.as_deref())?;
                info!(tool = "list_vms", uri = %ep.uri, no_cache = p.no_cache, "tool call");
                Ok(serde_json::to_value(
                    handlers::list_vms(self, &ep, p.no_cache).await?,
                )?)
            }
            methods::GET_VNC_PORTS => {
                let p: VncPortsParams = params::parse(args)?;
                let ep = self.endpoint(p.connection.as_deref())?;
                info!(tool = "get_vnc_ports", uri = %ep.uri, no_cache = p.no_cache, "tool call");
                Ok(serde_json::to_value(
                    handlers::get_vnc_ports(self, &ep, p.no_cache).await?,
                )?)
            }
            methods::GET_VM_IP => {
                let p: VmNameParams = params::parse(args)?;
                params::validate_vm_name(&p.name)?;
                let ep = self.endpoint(p.connection.as_deref())?;
                info!(tool = "get_vm_ip", uri = %ep.uri, vm = %p.name, "tool call");
                Ok(serde_json::to_value(
                    handlers::get_vm_ip(self, &ep, &p.name).await?,
                )?)
            }
            methods::CREATE_VM => {
                let p: CreateVmParams = params::parse(args)?;
                let connection = params::connection_uri(p.connection.as_deref())?
                    .map(str::to_string);
                let spec = params::resolve_create(p, &self.config.vm).await?;
                let ep = self.endpoint(connection.as_deref())?;
                let name = spec.name.clone();
                self.mutate(&ep, &name, Mutation::Create(spec)).await
            }
            methods::START_VM => {
                let p: VmNameParams = params::parse(args)?;
                params::validate_vm_name(&p.name)?;
                let ep = self.endpoint(p.connection.as_deref())?;
                self.mutate(&ep, &p.name, Mutation::Start).await
            }
            methods::STOP_VM => {
                let p: StopVmParams = params::parse(args)?;
                params::validate_vm_name(&p.name)?;
                let ep = self.endpoint(p.connection.as_deref())?;
                self.mutate(&ep, &p.name, Mutation::Stop { force: p.force })
                    .await
            }
            methods::REBOOT_VM => {
                let p: VmNameParams = params::parse(args)?;
                params::validate_vm_name(&p.name)?;
                let ep = self.endpoint(p.connection.as_deref())?;
                self.mutate(&ep, &p.name, Mutation::Reboot).await
            }
            other => Err(Error::MethodNotFound(other.to_string())),
        }
    }

    #[instrument(skip(self, ep, mutation), fields(uri = %ep.uri, tool = mutation.tool()))]
    async fn mutate(&self, ep: &Endpoint, name: &str, mutation: Mutation) -> Result<Value> {
        info!(vm = name, tool = mutation.tool(), "tool call");

        let vm_lock = self.lock_vm(ep, name).await?;
        let mut conn = match self.acquire(ep).await {
            Ok(conn) => conn,
            Err(e) => {
                ep.cache.invalidate(name);
                return Err(e);
            }
        };

        if matches!(mutation, Mutation::Create(_)) {
            ep.cache.invalidate(name);
        }
        let executed = handlers::execute(&mut *conn, name, &mutation).await;

        ep.cache.invalidate(name);
        if let Mutation::Create(_) = mutation {
            match &executed {
                Ok((_, Some(seed))) => {
                    ep.cache.put(name, seed.clone());
                    ep.cache.note_created(name);
                }
                Ok((_, None)) => {}
                // A half-finished create may have left a domain behind.
                Err(_) => ep.cache.invalidate_inventory(),
            }
        }

        let executed = settle(conn, executed);
        drop(vm_lock);

        let (result, _) = executed?;
        info!(vm = name, state = %result.state, "tool call complete");
        Ok(serde_json::to_value::<VmActionResult>(result)?)
    }
}

fn initialize_result() -> InitializeResult {
    InitializeResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: json!({ "tools": methods::TOOLS }),
        server_info: ServerInfo {
            name: SERVER_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    }
}

/// Bounded-cardinality method label for metrics and logs. `tools/call` is
/// reported under the tool it invokes.
fn metric_label(method: &str, params: &Value) -> &'static str {
    let name = if method == methods::TOOLS_CALL {
        params.get("name").and_then(Value::as_str).unwrap_or(method)
    } else {
        method
    };
    [methods::INITIALIZE, methods::TOOLS_CALL]
        .into_iter()
        .chain(methods::TOOLS.iter().copied())
        .find(|known| *known == name)
        .unwrap_or("unknown")
}
