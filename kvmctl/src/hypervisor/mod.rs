//! Hypervisor collaborator boundary.
//!
//! The pool hands out [`Session`]s created by a [`Connector`]. The production
//! implementation shells out to `virsh`; tests use an in-memory fake.

pub mod virsh;

#[cfg(test)]
pub mod fake;

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::provision::ignition::IgnitionSpec;

/// Opens sessions to a hypervisor endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a session to `uri`. Errors are reported as-is; the pool decides
    /// whether to retry.
    async fn connect(&self, uri: &str) -> Result<Box<dyn Session>>;
}

/// A live session to one hypervisor endpoint.
///
/// Errors classified as [`crate::error::Error::ConnectionBroken`] mean the
/// session itself is unusable and must not be returned to the pool.
#[async_trait]
pub trait Session: Send + 'static {
    fn uri(&self) -> &str;

    /// Cheap liveness probe run before the pool hands the session out.
    async fn ping(&mut self) -> Result<()>;

    /// All defined domains, in hypervisor order.
    async fn list_domains(&mut self) -> Result<Vec<String>>;

    /// `None` when the domain does not exist.
    async fn domain_info(&mut self, name: &str) -> Result<Option<DomainInfo>>;

    /// VNC TCP port, or `None` when the domain has no usable display.
    async fn vnc_port(&mut self, name: &str) -> Result<Option<u16>>;

    /// First IPv4 address on any of the domain's interfaces.
    async fn ip_address(&mut self, name: &str) -> Result<Option<Ipv4Addr>>;

    /// Provision storage for `spec`, define the domain and boot it.
    async fn define_and_start(&mut self, spec: &DomainSpec) -> Result<()>;

    async fn start(&mut self, name: &str) -> Result<()>;

    /// ACPI shutdown request.
    async fn shutdown(&mut self, name: &str) -> Result<()>;

    /// Hard power-off.
    async fn destroy(&mut self, name: &str) -> Result<()>;

    async fn reboot(&mut self, name: &str) -> Result<()>;

    async fn close(&mut self) {}
}

// ---------------------------------------------------------------------------
// Domain state
// ---------------------------------------------------------------------------

/// libvirt domain state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    #[serde(rename = "no state")]
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    Suspended,
    Unknown,
}

impl DomainState {
    /// Parse the `State:` value printed by `virsh dominfo` / `virsh domstate`.
    pub fn from_virsh(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" => DomainState::Running,
            "idle" | "blocked" => DomainState::Blocked,
            "paused" => DomainState::Paused,
            "in shutdown" | "shutdown" => DomainState::Shutdown,
            "shut off" | "shutoff" => DomainState::Shutoff,
            "crashed" => DomainState::Crashed,
            "pmsuspended" | "suspended" => DomainState::Suspended,
            "no state" | "nostate" => DomainState::NoState,
            _ => DomainState::Unknown,
        }
    }

    /// Whether the domain has a running QEMU process.
    pub fn is_active(self) -> bool {
        !matches!(self, DomainState::Shutoff | DomainState::Crashed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DomainState::NoState => "no state",
            DomainState::Running => "running",
            DomainState::Blocked => "blocked",
            DomainState::Paused => "paused",
            DomainState::Shutdown => "shutdown",
            DomainState::Shutoff => "shutoff",
            DomainState::Crashed => "crashed",
            DomainState::Suspended => "suspended",
            DomainState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one domain as reported by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainInfo {
    pub name: String,
    pub state: DomainState,
    pub memory_mib: u64,
    pub vcpus: u32,
}

// ---------------------------------------------------------------------------
// Domain creation
// ---------------------------------------------------------------------------

/// Fully resolved `create_vm` request: defaults applied, SSH key loaded.
#[derive(Debug, Clone)]
pub struct DomainSpec {
    pub name: String,
    pub memory_mib: u64,
    pub vcpus: u32,
    pub disk_size_gib: u64,
    pub os_variant: String,
    /// Bridge the NIC attaches to.
    pub network: String,
    pub source: InstallSource,
}

#[derive(Debug, Clone)]
pub enum InstallSource {
    /// Thin qcow2 overlay on a master image, configured through Ignition.
    MasterImage {
        path: PathBuf,
        ignition: IgnitionSpec,
    },
    /// Fresh disk installed from an ISO via `virt-install`.
    Cdrom { iso: PathBuf },
}
