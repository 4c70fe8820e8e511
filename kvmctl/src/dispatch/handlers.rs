use std::net::Ipv4Addr;

use kvmctl_protocol::{VmActionResult, VmAddress, VmSummary, VncPorts};
use tracing::{debug, warn};

use super::{Dispatcher, Endpoint};
use crate::cache::{DisplayPort, VmRecord};
use crate::error::{Error, Result};
use crate::hypervisor::{DomainInfo, DomainSpec, DomainState, Session};
use crate::pool::PooledConnection;

/// A state-changing operation on one VM.
#[derive(Debug)]
pub(super) enum Mutation {
    Create(DomainSpec),
    Start,
    Stop { force: bool },
    Reboot,
}

impl Mutation {
    pub(super) fn tool(&self) -> &'static str {
        match self {
            Mutation::Create(_) => "create_vm",
            Mutation::Start => "start_vm",
            Mutation::Stop { .. } => "stop_vm",
            Mutation::Reboot => "reboot_vm",
        }
    }
}

/// Hand a connection back, marking it broken first if `result` says the
/// session died.
pub(super) fn settle<T>(mut conn: PooledConnection, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        if e.is_connection_failure() {
            warn!(
                uri = conn.uri(),
                conn_id = conn.id(),
                error = %e,
                "session failed, marking connection broken"
            );
            conn.mark_broken();
        }
    }
    conn.release();
    result
}

fn action(name: &str, state: &str) -> VmActionResult {
    VmActionResult {
        name: name.to_string(),
        state: state.to_string(),
    }
}

async fn require_domain(session: &mut dyn Session, name: &str) -> Result<DomainInfo> {
    session
        .domain_info(name)
        .await?
        .ok_or_else(|| Error::VmNotFound(name.to_string()))
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

/// Run `mutation` against `name`. On success also returns the record to seed
/// the cache with, for creates.
pub(super) async fn execute(
    session: &mut dyn Session,
    name: &str,
    mutation: &Mutation,
) -> Result<(VmActionResult, Option<VmRecord>)> {
    match mutation {
        Mutation::Start => {
            let info = require_domain(session, name).await?;
            if info.state.is_active() {
                return Err(Error::InvalidState(format!("VM {name} is already running")));
            }
            session.start(name).await?;
            Ok((action(name, "running"), None))
        }
        Mutation::Stop { force } => {
            let info = require_domain(session, name).await?;
            if !info.state.is_active() {
                return Err(Error::InvalidState(format!("VM {name} is already stopped")));
            }
            if *force {
                session.destroy(name).await?;
                Ok((action(name, "shutoff"), None))
            } else {
                session.shutdown(name).await?;
                Ok((action(name, "shutdown"), None))
            }
        }
        Mutation::Reboot => {
            let info = require_domain(session, name).await?;
            if !info.state.is_active() {
                return Err(Error::InvalidState(format!(
                    "Cannot reboot VM {name}: VM is not running"
                )));
            }
            session.reboot(name).await?;
            Ok((action(name, "running"), None))
        }
        Mutation::Create(spec) => {
            if session.list_domains().await?.iter().any(|n| n == name) {
                return Err(Error::VmAlreadyExists(name.to_string()));
            }
            session.define_and_start(spec).await?;

            let seed = match session.domain_info(name).await {
                Ok(Some(info)) => VmRecord::from(info),
                Ok(None) | Err(_) => VmRecord {
                    name: name.to_string(),
                    state: DomainState::Running,
                    memory_mib: spec.memory_mib,
                    vcpus: spec.vcpus,
                    display: DisplayPort::Unprobed,
                },
            };
            Ok((action(name, "created"), Some(seed)))
        }
    }
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

impl From<&VmRecord> for VmSummary {
    fn from(r: &VmRecord) -> Self {
        VmSummary {
            name: r.name.clone(),
            state: r.state.to_string(),
            memory: r.memory_mib,
            vcpus: r.vcpus,
        }
    }
}

pub(super) async fn list_vms(
    dispatcher: &Dispatcher,
    ep: &Endpoint,
    no_cache: bool,
) -> Result<Vec<VmSummary>> {
    let records = collect_records(dispatcher, ep, no_cache).await?;
    Ok(records.iter().map(VmSummary::from).collect())
}

pub(super) async fn get_vnc_ports(
    dispatcher: &Dispatcher,
    ep: &Endpoint,
    no_cache: bool,
) -> Result<VncPorts> {
    let records = collect_records(dispatcher, ep, no_cache).await?;

    let mut ports = VncPorts::new();
    let mut unprobed = Vec::new();
    for record in records.iter().filter(|r| r.state.is_active()) {
        match record.display {
            DisplayPort::Port(port) if !no_cache => {
                ports.insert(record.name.clone(), port);
            }
            DisplayPort::Absent if !no_cache => {}
            _ => unprobed.push(record.name.as_str()),
        }
    }
    if unprobed.is_empty() {
        return Ok(ports);
    }

    let mut conn = dispatcher.acquire(ep).await?;
    let probed = probe_displays(&mut *conn, &unprobed).await;
    for (name, port) in settle(conn, probed)? {
        let display = port.map_or(DisplayPort::Absent, DisplayPort::Port);
        ep.cache.amend(&name, |r| r.display = display);
        if let Some(port) = port {
            ports.insert(name, port);
        }
    }
    Ok(ports)
}

/// Live address lookup. Leases change independently of domain state, so
/// nothing here is cached.
pub(super) async fn get_vm_ip(
    dispatcher: &Dispatcher,
    ep: &Endpoint,
    name: &str,
) -> Result<VmAddress> {
    let mut conn = dispatcher.acquire(ep).await?;
    let looked_up = lookup_ip(&mut *conn, name).await;
    let ip = settle(conn, looked_up)?;
    Ok(VmAddress {
        name: name.to_string(),
        ip,
    })
}

async fn lookup_ip(session: &mut dyn Session, name: &str) -> Result<Option<Ipv4Addr>> {
    let info = require_domain(session, name).await?;
    if !info.state.is_active() {
        return Ok(None);
    }
    session.ip_address(name).await
}

async fn probe_displays(
    session: &mut dyn Session,
    names: &[&str],
) -> Result<Vec<(String, Option<u16>)>> {
    let mut found = Vec::with_capacity(names.len());
    for &name in names {
        match session.vnc_port(name).await {
            Ok(port) => found.push((name.to_string(), port)),
            Err(Error::VmNotFound(_)) => debug!(vm = name, "domain vanished before display probe"),
            Err(e) if e.is_connection_failure() => return Err(e),
            Err(e) => warn!(vm = name, error = %e, "failed to query VNC display"),
        }
    }
    Ok(found)
}

/// Current records for every domain on the endpoint, in hypervisor order.
///
/// Served entirely from cache when the inventory and every record are fresh;
/// otherwise one pooled connection fills in whatever is missing.
async fn collect_records(
    dispatcher: &Dispatcher,
    ep: &Endpoint,
    no_cache: bool,
) -> Result<Vec<VmRecord>> {
    let inventory = if no_cache { None } else { ep.cache.inventory() };
    if let Some(names) = &inventory {
        let cached: Option<Vec<VmRecord>> = names.iter().map(|n| ep.cache.get(n)).collect();
        if let Some(records) = cached {
            return Ok(records);
        }
    }

    let mut conn = dispatcher.acquire(ep).await?;
    let refreshed = refresh_records(&mut *conn, ep, inventory, no_cache).await;
    settle(conn, refreshed)
}

async fn refresh_records(
    session: &mut dyn Session,
    ep: &Endpoint,
    inventory: Option<Vec<String>>,
    no_cache: bool,
) -> Result<Vec<VmRecord>> {
    let observed = ep.cache.generation();
    let names = match inventory {
        Some(names) => names,
        None => {
            let names = session.list_domains().await?;
            ep.cache.set_inventory(observed, names.clone());
            names
        }
    };

    let mut records = Vec::with_capacity(names.len());
    let mut vanished = false;
    for name in names {
        if !no_cache {
            if let Some(record) = ep.cache.get(&name) {
                records.push(record);
                continue;
            }
        }
        match session.domain_info(&name).await {
            Ok(Some(info)) => {
                let record = VmRecord::from(info);
                ep.cache.put_observed(observed, &name, record.clone());
                records.push(record);
            }
            Ok(None) => {
                debug!(vm = %name, "domain vanished while listing");
                vanished = true;
            }
            Err(e) if e.is_connection_failure() => return Err(e),
            Err(e) => {
                // Report the domain without caching a guess.
                warn!(vm = %name, error = %e, "failed to query domain");
                records.push(VmRecord {
                    name,
                    state: DomainState::Unknown,
                    memory_mib: 0,
                    vcpus: 0,
                    display: DisplayPort::Absent,
                });
            }
        }
    }
    if vanished {
        ep.cache.invalidate_inventory();
    }
    Ok(records)
}
