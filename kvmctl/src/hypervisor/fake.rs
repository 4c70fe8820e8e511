//! In-memory hypervisor for tests.
//!
//! Records call counts, injects failures and can slow every operation down so
//! tests can observe overlap between concurrent callers.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Connector, DomainInfo, DomainSpec, DomainState, Session};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct FakeDomain {
    pub name: String,
    pub state: DomainState,
    pub memory_mib: u64,
    pub vcpus: u32,
    pub vnc_port: Option<u16>,
    pub ip: Option<Ipv4Addr>,
}

#[derive(Default)]
struct FakeState {
    domains: Mutex<Vec<FakeDomain>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    delay: Mutex<Duration>,
    mutation_failure: Mutex<Option<String>>,
    /// Mutating calls currently executing, per VM.
    executing: Mutex<HashMap<String, usize>>,
    overlaps: AtomicUsize,
    /// Calls running across all sessions.
    active: AtomicUsize,
    peak_active: AtomicUsize,
    connects: AtomicUsize,
    closed: AtomicUsize,
    failing_connects: AtomicUsize,
    failing_pings: AtomicUsize,
    breaking_ops: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct FakeHypervisor {
    state: Arc<FakeState>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a domain with 2 GiB / 2 vCPUs. Running domains get the next VNC
    /// port and a 192.168.122.x address.
    pub fn with_domain(self, name: &str, state: DomainState) -> Self {
        let running = state == DomainState::Running;
        let port = running.then(|| self.next_port());
        let ip = running.then(|| {
            let n = self.state.domains.lock().len() as u8;
            Ipv4Addr::new(192, 168, 122, 10 + n)
        });
        self.add_domain(FakeDomain {
            name: name.to_string(),
            state,
            memory_mib: 2048,
            vcpus: 2,
            vnc_port: port,
            ip,
        });
        self
    }

    pub fn add_domain(&self, domain: FakeDomain) {
        self.state.domains.lock().push(domain);
    }

    pub fn state_of(&self, name: &str) -> Option<DomainState> {
        self.state
            .domains
            .lock()
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.state)
    }

    pub fn calls(&self, op: &str) -> usize {
        self.state.calls.lock().get(op).copied().unwrap_or(0)
    }

    /// Calls made to the hypervisor, excluding liveness pings.
    pub fn total_calls(&self) -> usize {
        self.state
            .calls
            .lock()
            .iter()
            .filter(|(op, _)| **op != "ping")
            .map(|(_, n)| n)
            .sum()
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn closed_sessions(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock() = delay;
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.state.failing_connects.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_pings(&self, n: usize) {
        self.state.failing_pings.store(n, Ordering::SeqCst);
    }

    /// The next `n` non-ping calls fail as if the session died.
    pub fn break_next_ops(&self, n: usize) {
        self.state.breaking_ops.store(n, Ordering::SeqCst);
    }

    /// Make every mutating call fail with a hypervisor error.
    pub fn fail_mutations(&self, message: Option<&str>) {
        *self.state.mutation_failure.lock() = message.map(str::to_string);
    }

    /// Number of times two mutating calls on the same VM ran at once.
    pub fn overlaps(&self) -> usize {
        self.state.overlaps.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.state.peak_active.load(Ordering::SeqCst)
    }

    fn next_port(&self) -> u16 {
        let used = self
            .state
            .domains
            .lock()
            .iter()
            .filter_map(|d| d.vnc_port)
            .max();
        used.map_or(5900, |p| p + 1)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Connector for FakeHypervisor {
    async fn connect(&self, uri: &str) -> Result<Box<dyn Session>> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.state.failing_connects) {
            return Err(Error::Hypervisor(format!("cannot reach {uri}")));
        }
        Ok(Box::new(FakeSession {
            hv: self.clone(),
            uri: uri.to_string(),
        }))
    }
}

pub struct FakeSession {
    hv: FakeHypervisor,
    uri: String,
}

impl FakeSession {
    /// Run `f` as one hypervisor call named `op`. `mutating` names the VM a
    /// state-changing call targets, for overlap tracking.
    async fn call<T>(
        &self,
        op: &'static str,
        mutating: Option<&str>,
        f: impl FnOnce(&mut Vec<FakeDomain>) -> Result<T>,
    ) -> Result<T> {
        let state = &self.hv.state;
        *state.calls.lock().entry(op).or_default() += 1;

        let active = state.active.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak_active.fetch_max(active, Ordering::SeqCst);
        if let Some(vm) = mutating {
            let mut executing = state.executing.lock();
            let n = executing.entry(vm.to_string()).or_default();
            if *n > 0 {
                state.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            *n += 1;
        }

        let delay = *state.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = if take_one(&state.breaking_ops) {
            Err(Error::ConnectionBroken {
                uri: self.uri.clone(),
                reason: "connection reset by peer".into(),
            })
        } else if let (Some(_), Some(msg)) = (mutating, state.mutation_failure.lock().clone()) {
            Err(Error::Hypervisor(msg))
        } else {
            f(&mut state.domains.lock())
        };

        if let Some(vm) = mutating {
            if let Some(n) = state.executing.lock().get_mut(vm) {
                *n -= 1;
            }
        }
        state.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn find<'a>(domains: &'a mut [FakeDomain], name: &str) -> Result<&'a mut FakeDomain> {
    domains
        .iter_mut()
        .find(|d| d.name == name)
        .ok_or_else(|| Error::VmNotFound(name.to_string()))
}

#[async_trait]
impl Session for FakeSession {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn ping(&mut self) -> Result<()> {
        *self.hv.state.calls.lock().entry("ping").or_default() += 1;
        if take_one(&self.hv.state.failing_pings) {
            return Err(Error::ConnectionBroken {
                uri: self.uri.clone(),
                reason: "ping failed".into(),
            });
        }
        Ok(())
    }

    async fn list_domains(&mut self) -> Result<Vec<String>> {
        self.call("list_domains", None, |domains| {
            Ok(domains.iter().map(|d| d.name.clone()).collect())
        })
        .await
    }

    async fn domain_info(&mut self, name: &str) -> Result<Option<DomainInfo>> {
        self.call("domain_info", None, |domains| {
            Ok(domains.iter().find(|d| d.name == name).map(|d| DomainInfo {
                name: d.name.clone(),
                state: d.state,
                memory_mib: d.memory_mib,
                vcpus: d.vcpus,
            }))
        })
        .await
    }

    async fn vnc_port(&mut self, name: &str) -> Result<Option<u16>> {
        self.call("vnc_port", None, |domains| {
            let d = find(domains, name)?;
            Ok(if d.state.is_active() { d.vnc_port } else { None })
        })
        .await
    }

    async fn ip_address(&mut self, name: &str) -> Result<Option<Ipv4Addr>> {
        self.call("ip_address", None, |domains| {
            let d = find(domains, name)?;
            Ok(if d.state.is_active() { d.ip } else { None })
        })
        .await
    }

    async fn define_and_start(&mut self, spec: &DomainSpec) -> Result<()> {
        let port = self.hv.next_port();
        self.call("define_and_start", Some(&spec.name), |domains| {
            if domains.iter().any(|d| d.name == spec.name) {
                return Err(Error::Hypervisor(format!(
                    "domain '{}' already exists",
                    spec.name
                )));
            }
            domains.push(FakeDomain {
                name: spec.name.clone(),
                state: DomainState::Running,
                memory_mib: spec.memory_mib,
                vcpus: spec.vcpus,
                vnc_port: Some(port),
                ip: None,
            });
            Ok(())
        })
        .await
    }

    async fn start(&mut self, name: &str) -> Result<()> {
        self.call("start", Some(name), |domains| {
            let d = find(domains, name)?;
            if d.state == DomainState::Running {
                return Err(Error::Hypervisor("domain is already running".into()));
            }
            d.state = DomainState::Running;
            Ok(())
        })
        .await
    }

    async fn shutdown(&mut self, name: &str) -> Result<()> {
        self.call("shutdown", Some(name), |domains| {
            find(domains, name)?.state = DomainState::Shutoff;
            Ok(())
        })
        .await
    }

    async fn destroy(&mut self, name: &str) -> Result<()> {
        self.call("destroy", Some(name), |domains| {
            find(domains, name)?.state = DomainState::Shutoff;
            Ok(())
        })
        .await
    }

    async fn reboot(&mut self, name: &str) -> Result<()> {
        self.call("reboot", Some(name), |domains| {
            find(domains, name)?.state = DomainState::Running;
            Ok(())
        })
        .await
    }

    async fn close(&mut self) {
        self.hv.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}
