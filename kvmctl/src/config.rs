use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Prefix for environment overrides, e.g. `KVMCTL_POOL_MAX_CONNECTIONS`.
pub const ENV_PREFIX: &str = "KVMCTL";

/// Top-level configuration for the kvmctl server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub hypervisor: HypervisorConfig,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub vm: VmConfig,
}

impl Config {
    /// Load configuration from an optional TOML file, then apply `KVMCTL_*`
    /// environment overrides and validate the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config: {}", path.display()))?;
                toml::from_str::<Config>(&content)
                    .with_context(|| format!("parsing config: {}", path.display()))?
            }
            None => Config::default(),
        };
        config.apply_env_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from the environment onto this config.
    ///
    /// Each leaf key maps to `KVMCTL_<SECTION>_<KEY>` (nested sections are
    /// joined the same way). The raw string is converted to the type of the
    /// value it replaces. A value that does not convert leaves the original in
    /// place, and an empty string only replaces string fields. Returns the
    /// number of overrides applied.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<usize>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut tree =
            toml::Value::try_from(&*self).context("serializing config for env overrides")?;
        let applied = override_table(&mut tree, ENV_PREFIX, &lookup);
        if applied > 0 {
            *self = tree
                .try_into()
                .context("applying environment overrides to config")?;
        }
        Ok(applied)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.hypervisor.uri.trim().is_empty(),
            "hypervisor.uri must not be empty"
        );
        anyhow::ensure!(
            self.hypervisor.command_timeout_secs >= 1,
            "hypervisor.command_timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            self.pool.max_connections >= 1,
            "pool.max_connections must be >= 1"
        );
        anyhow::ensure!(
            self.pool.acquire_timeout_secs >= 1,
            "pool.acquire_timeout_secs must be >= 1"
        );
        anyhow::ensure!(self.cache.max_size >= 1, "cache.max_size must be >= 1");
        anyhow::ensure!(self.cache.ttl_secs >= 1, "cache.ttl_secs must be >= 1");
        anyhow::ensure!(
            self.vm.default_vcpus >= 1,
            "vm.default_vcpus must be >= 1"
        );
        anyhow::ensure!(
            self.vm.default_memory >= 256,
            "vm.default_memory must be >= 256"
        );
        anyhow::ensure!(
            self.vm.default_disk_size >= 1,
            "vm.default_disk_size must be >= 1"
        );
        Ok(())
    }
}

fn override_table<F>(value: &mut toml::Value, prefix: &str, lookup: &F) -> usize
where
    F: Fn(&str) -> Option<String>,
{
    let toml::Value::Table(table) = value else {
        return 0;
    };

    let mut applied = 0;
    for (key, entry) in table.iter_mut() {
        let var = format!("{prefix}_{}", key.to_uppercase());
        if entry.is_table() {
            applied += override_table(entry, &var, lookup);
            continue;
        }
        let Some(raw) = lookup(&var) else {
            continue;
        };
        match coerce_like(entry, &raw) {
            Some(converted) => {
                debug!(var = %var, "config value overridden from environment");
                *entry = converted;
                applied += 1;
            }
            None => {
                warn!(var = %var, value = %raw, "ignoring environment override that does not match the field type");
            }
        }
    }
    applied
}

/// Convert `raw` to the same TOML type as `current`.
fn coerce_like(current: &toml::Value, raw: &str) -> Option<toml::Value> {
    use toml::Value;

    match current {
        Value::String(_) => Some(Value::String(raw.to_string())),
        _ if raw.trim().is_empty() => None,
        // Every integer in the config is unsigned.
        Value::Integer(_) => raw
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|n| *n >= 0)
            .map(Value::Integer),
        Value::Float(_) => raw.trim().parse::<f64>().ok().map(Value::Float),
        Value::Boolean(_) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(Value::Boolean(true)),
            "false" | "0" | "no" | "off" => Some(Value::Boolean(false)),
            _ => None,
        },
        _ => None,
    }
}

/// Hypervisor endpoint and the external tools used to drive it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Default libvirt connection URI. Requests may name another via `connection`.
    pub uri: String,
    pub virsh_binary: String,
    pub qemu_img_binary: String,
    pub virt_install_binary: String,
    /// Upper bound for any single external command.
    pub command_timeout_secs: u64,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".into(),
            virsh_binary: "virsh".into(),
            qemu_img_binary: "qemu-img".into(),
            virt_install_binary: "virt-install".into(),
            command_timeout_secs: 60,
        }
    }
}

impl HypervisorConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Hypervisor connection pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub acquire_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout_secs: 30,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// VM information cache bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_size: usize,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 50,
            ttl_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Defaults applied to `create_vm` requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Directory holding disk images, ignition files and rendered domain XML.
    pub disk_path: PathBuf,
    /// MiB.
    pub default_memory: u64,
    pub default_vcpus: u32,
    /// GiB.
    pub default_disk_size: u64,
    pub default_os_variant: String,
    /// Bridge the VM NIC attaches to.
    pub default_network: String,
    /// Empty means unset.
    pub default_master_image: String,
    /// Empty means unset.
    pub default_iso: String,
    pub ignition: IgnitionDefaults,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            disk_path: PathBuf::from("/vm"),
            default_memory: 2048,
            default_vcpus: 2,
            default_disk_size: 20,
            default_os_variant: "fedora-coreos-stable".into(),
            default_network: "brforvms".into(),
            default_master_image: String::new(),
            default_iso: String::new(),
            ignition: IgnitionDefaults::default(),
        }
    }
}

impl VmConfig {
    pub fn master_image(&self) -> Option<&str> {
        non_empty(&self.default_master_image)
    }

    pub fn iso(&self) -> Option<&str> {
        non_empty(&self.default_iso)
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let s = s.trim();
    (!s.is_empty()).then_some(s)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnitionDefaults {
    pub default_hostname: String,
    pub default_user: String,
    /// Path to the SSH public key; `~` is expanded at request time.
    pub default_ssh_key: String,
    pub default_timezone: String,
    pub default_locale: String,
}

impl Default for IgnitionDefaults {
    fn default() -> Self {
        Self {
            default_hostname: "coreos".into(),
            default_user: "core".into(),
            default_ssh_key: "~/.ssh/id_rsa.pub".into(),
            default_timezone: "UTC".into(),
            default_locale: "en_US.UTF-8".into(),
        }
    }
}
