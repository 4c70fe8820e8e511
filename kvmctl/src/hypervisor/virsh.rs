use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::{Connector, DomainInfo, DomainSpec, DomainState, InstallSource, Session};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::provision::ignition::IgnitionSpec;
use crate::provision::{self, DiskLayout};

/// First TCP port used for VNC display `:0`.
pub const VNC_BASE_PORT: u32 = 5900;

/// External tools and limits used by virsh sessions.
#[derive(Debug, Clone)]
pub struct VirshSettings {
    pub virsh_binary: String,
    pub qemu_img_binary: String,
    pub virt_install_binary: String,
    pub command_timeout: Duration,
    pub disk_dir: PathBuf,
}

impl VirshSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            virsh_binary: config.hypervisor.virsh_binary.clone(),
            qemu_img_binary: config.hypervisor.qemu_img_binary.clone(),
            virt_install_binary: config.hypervisor.virt_install_binary.clone(),
            command_timeout: config.hypervisor.command_timeout(),
            disk_dir: config.vm.disk_path.clone(),
        }
    }
}

/// Connector that drives libvirt through the `virsh` CLI.
///
/// virsh opens its own libvirt connection per invocation, so a "session" is
/// just the URI plus settings; the pool's ping is what reaches libvirtd.
pub struct VirshConnector {
    settings: Arc<VirshSettings>,
}

impl VirshConnector {
    pub fn new(settings: VirshSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }
}

#[async_trait]
impl Connector for VirshConnector {
    async fn connect(&self, uri: &str) -> Result<Box<dyn Session>> {
        debug!(uri, binary = %self.settings.virsh_binary, "virsh session opened");
        Ok(Box::new(VirshSession {
            uri: uri.to_string(),
            settings: Arc::clone(&self.settings),
        }))
    }
}

struct VirshSession {
    uri: String,
    settings: Arc<VirshSettings>,
}

impl VirshSession {
    /// Run `virsh -c <uri> <args>` and return stdout. `subject` names the
    /// domain the command targets so not-found errors can say which.
    async fn virsh(&self, args: &[&str], subject: Option<&str>) -> Result<String> {
        let mut full = vec!["-c", self.uri.as_str()];
        full.extend_from_slice(args);
        let subcommand = args.first().copied().unwrap_or("");

        match run_command(&self.settings.virsh_binary, &full, self.settings.command_timeout).await
        {
            Ok(stdout) => Ok(stdout),
            Err(CommandFailure::Exit(stderr)) => {
                Err(classify_virsh_failure(&self.uri, subcommand, subject, &stderr))
            }
            Err(failure) => Err(Error::Hypervisor(format!(
                "virsh {subcommand}: {failure}"
            ))),
        }
    }

    async fn run_tool(&self, program: &str, args: &[String]) -> Result<()> {
        run_command(program, args, self.settings.command_timeout)
            .await
            .map(|_| ())
            .map_err(|failure| Error::Hypervisor(format!("{program} failed: {failure}")))
    }

    async fn provision_from_image(
        &self,
        spec: &DomainSpec,
        master: &Path,
        ignition: &IgnitionSpec,
    ) -> Result<()> {
        let layout = DiskLayout::new(&self.settings.disk_dir, &spec.name);
        ensure_absent(&layout.disk).await?;
        tokio::fs::create_dir_all(&self.settings.disk_dir)
            .await
            .map_err(|e| io_error("creating disk directory", &self.settings.disk_dir, e))?;

        let mut defined = false;
        let result = self
            .provision_steps(spec, master, ignition, &layout, &mut defined)
            .await;
        if let Err(e) = &result {
            warn!(vm = %spec.name, error = %e, "provisioning failed, cleaning up");
            if defined {
                if let Err(undef) = self.virsh(&["undefine", spec.name.as_str()], Some(&spec.name)).await {
                    warn!(vm = %spec.name, error = %undef, "failed to undefine partially created domain");
                }
            }
            remove_files(&layout.all()).await;
        }
        result
    }

    async fn provision_steps(
        &self,
        spec: &DomainSpec,
        master: &Path,
        ignition: &IgnitionSpec,
        layout: &DiskLayout,
        defined: &mut bool,
    ) -> Result<()> {
        let args = provision::qemu_img_overlay_args(master, &layout.disk, spec.disk_size_gib);
        self.run_tool(&self.settings.qemu_img_binary, &args).await?;

        let doc = serde_json::to_string_pretty(&ignition.to_json())?;
        tokio::fs::write(&layout.ignition, doc)
            .await
            .map_err(|e| io_error("writing ignition config", &layout.ignition, e))?;

        let xml = provision::render_domain_xml(spec, &layout.disk, &layout.ignition);
        tokio::fs::write(&layout.domain_xml, xml)
            .await
            .map_err(|e| io_error("writing domain XML", &layout.domain_xml, e))?;

        let xml_path = layout.domain_xml.display().to_string();
        self.virsh(&["define", xml_path.as_str()], None).await?;
        *defined = true;
        self.virsh(&["start", spec.name.as_str()], Some(&spec.name)).await?;
        Ok(())
    }

    async fn install_from_cdrom(&self, spec: &DomainSpec, iso: &Path) -> Result<()> {
        let layout = DiskLayout::new(&self.settings.disk_dir, &spec.name);
        ensure_absent(&layout.disk).await?;
        tokio::fs::create_dir_all(&self.settings.disk_dir)
            .await
            .map_err(|e| io_error("creating disk directory", &self.settings.disk_dir, e))?;

        let args = provision::virt_install_args(&self.uri, spec, &layout.disk, iso);
        let result = self.run_tool(&self.settings.virt_install_binary, &args).await;
        if result.is_err() {
            remove_files(&[layout.disk.as_path()]).await;
        }
        result
    }
}

#[async_trait]
impl Session for VirshSession {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn ping(&mut self) -> Result<()> {
        self.virsh(&["version"], None).await.map(|_| ())
    }

    #[instrument(skip(self), fields(uri = %self.uri))]
    async fn list_domains(&mut self) -> Result<Vec<String>> {
        let out = self.virsh(&["list", "--all", "--name"], None).await?;
        Ok(parse_domain_list(&out))
    }

    #[instrument(skip(self), fields(uri = %self.uri))]
    async fn domain_info(&mut self, name: &str) -> Result<Option<DomainInfo>> {
        match self.virsh(&["dominfo", name], Some(name)).await {
            Ok(out) => parse_dominfo(&out).map(Some).ok_or_else(|| {
                Error::Hypervisor(format!("unexpected dominfo output for {name}"))
            }),
            Err(Error::VmNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(uri = %self.uri))]
    async fn vnc_port(&mut self, name: &str) -> Result<Option<u16>> {
        let out = self.virsh(&["vncdisplay", name], Some(name)).await?;
        Ok(parse_vnc_display(&out))
    }

    #[instrument(skip(self), fields(uri = %self.uri))]
    async fn ip_address(&mut self, name: &str) -> Result<Option<Ipv4Addr>> {
        let out = self.virsh(&["domifaddr", name], Some(name)).await?;
        Ok(parse_domifaddr(&out))
    }

    #[instrument(skip(self, spec), fields(uri = %self.uri, vm = %spec.name))]
    async fn define_and_start(&mut self, spec: &DomainSpec) -> Result<()> {
        match &spec.source {
            InstallSource::MasterImage { path, ignition } => {
                self.provision_from_image(spec, path, ignition).await?
            }
            InstallSource::Cdrom { iso } => self.install_from_cdrom(spec, iso).await?,
        }
        info!(vm = %spec.name, "domain defined and started");
        Ok(())
    }

    #[instrument(skip(self), fields(uri = %self.uri))]
    async fn start(&mut self, name: &str) -> Result<()> {
        self.virsh(&["start", name], Some(name)).await.map(|_| ())
    }

    #[instrument(skip(self), fields(uri = %self.uri))]
    async fn shutdown(&mut self, name: &str) -> Result<()> {
        self.virsh(&["shutdown", name], Some(name)).await.map(|_| ())
    }

    #[instrument(skip(self), fields(uri = %self.uri))]
    async fn destroy(&mut self, name: &str) -> Result<()> {
        self.virsh(&["destroy", name], Some(name)).await.map(|_| ())
    }

    #[instrument(skip(self), fields(uri = %self.uri))]
    async fn reboot(&mut self, name: &str) -> Result<()> {
        self.virsh(&["reboot", name], Some(name)).await.map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Command execution
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum CommandFailure {
    Spawn(std::io::Error),
    Timeout(Duration),
    /// Non-zero exit; carries trimmed stderr.
    Exit(String),
}

impl std::fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandFailure::Spawn(e) => write!(f, "failed to execute: {e}"),
            CommandFailure::Timeout(d) => write!(f, "timed out after {}s", d.as_secs()),
            CommandFailure::Exit(stderr) => f.write_str(stderr),
        }
    }
}

async fn run_command<S: AsRef<std::ffi::OsStr> + std::fmt::Debug>(
    program: &str,
    args: &[S],
    timeout: Duration,
) -> std::result::Result<String, CommandFailure> {
    debug!(program, args = ?args, "running command");

    let output = tokio::time::timeout(
        timeout,
        Command::new(program).args(args).kill_on_drop(true).output(),
    )
    .await
    .map_err(|_| CommandFailure::Timeout(timeout))?
    .map_err(CommandFailure::Spawn)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(CommandFailure::Exit(stderr));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn classify_virsh_failure(
    uri: &str,
    subcommand: &str,
    subject: Option<&str>,
    stderr: &str,
) -> Error {
    let lower = stderr.to_ascii_lowercase();
    if let Some(name) = subject {
        if lower.contains("failed to get domain") || lower.contains("domain not found") {
            return Error::VmNotFound(name.to_string());
        }
    }
    if lower.contains("failed to connect to the hypervisor")
        || lower.contains("failed to connect socket")
        || lower.contains("end of file while reading data")
        || lower.contains("unable to connect to server")
    {
        return Error::ConnectionBroken {
            uri: uri.to_string(),
            reason: stderr.to_string(),
        };
    }
    Error::Hypervisor(format!("virsh {subcommand} failed: {stderr}"))
}

async fn ensure_absent(path: &Path) -> Result<()> {
    match tokio::fs::try_exists(path).await {
        Ok(false) => Ok(()),
        Ok(true) => Err(Error::Hypervisor(format!(
            "disk image {} already exists",
            path.display()
        ))),
        Err(e) => Err(io_error("checking disk image", path, e)),
    }
}

async fn remove_files(paths: &[&Path]) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "cleanup failed"),
        }
    }
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> Error {
    Error::Hypervisor(format!("{action} {}: {e}", path.display()))
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

/// Parse `virsh list --all --name`: one name per line, blank lines ignored.
pub(crate) fn parse_domain_list(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `virsh dominfo`. Memory is reported in KiB and converted to MiB.
pub(crate) fn parse_dominfo(out: &str) -> Option<DomainInfo> {
    let mut name = None;
    let mut state = None;
    let mut vcpus = None;
    let mut memory_kib = None;

    for line in out.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Name" => name = Some(value.to_string()),
            "State" => state = Some(DomainState::from_virsh(value)),
            "CPU(s)" => vcpus = value.parse::<u32>().ok(),
            "Max memory" => {
                memory_kib = value
                    .split_whitespace()
                    .next()
                    .and_then(|n| n.parse::<u64>().ok())
            }
            _ => {}
        }
    }

    Some(DomainInfo {
        name: name?,
        state: state?,
        memory_mib: memory_kib? / 1024,
        vcpus: vcpus?,
    })
}

/// Parse `virsh vncdisplay` (`:N`, `host:N` or `[v6]:N`) into a TCP port.
pub(crate) fn parse_vnc_display(out: &str) -> Option<u16> {
    let out = out.trim();
    let (_, display) = out.rsplit_once(':')?;
    let display: u32 = display.trim().parse().ok()?;
    let port = VNC_BASE_PORT.checked_add(display)?;
    u16::try_from(port).ok()
}

/// Parse `virsh domifaddr`: the first `ipv4` row's address, CIDR suffix
/// stripped. Rows come after the dashed separator line.
pub(crate) fn parse_domifaddr(out: &str) -> Option<Ipv4Addr> {
    out.lines()
        .skip_while(|l| !l.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|l| {
            let fields: Vec<&str> = l.split_whitespace().collect();
            match fields.as_slice() {
                [_, _, "ipv4", addr, ..] => addr.split('/').next()?.parse().ok(),
                _ => None,
            }
        })
        .next()
}
