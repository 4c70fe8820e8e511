//! Request parameter parsing and validation.
//!
//! Everything here runs before any VM lock or pooled connection is taken, so
//! a malformed request never waits on or consumes shared resources.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use kvmctl_protocol::{CreateVmParams, IgnitionParams};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::config::VmConfig;
use crate::error::{Error, Result};
use crate::hypervisor::{DomainSpec, InstallSource};
use crate::provision::ignition::{load_ssh_key, IgnitionSpec};
use crate::util::expand_home;

pub const MAX_VM_NAME_LEN: usize = 64;
pub const MEMORY_MIB_RANGE: RangeInclusive<u64> = 256..=1024 * 1024;
pub const VCPU_RANGE: RangeInclusive<u32> = 1..=128;
pub const DISK_GIB_RANGE: RangeInclusive<u64> = 1..=10_000;

/// Deserialize `params`, treating a missing/null value as `{}`.
pub fn parse<T: DeserializeOwned>(params: Value) -> Result<T> {
    let params = match params {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(params).map_err(|e| Error::validation(e.to_string()))
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

/// VM names end up in file paths, XML and command lines.
pub fn validate_vm_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation("VM name not provided"));
    }
    if name.len() > MAX_VM_NAME_LEN {
        return Err(Error::validation(format!(
            "VM name too long ({} chars, max {MAX_VM_NAME_LEN})",
            name.len()
        )));
    }
    if !name.chars().all(is_name_char) || name.starts_with('.') {
        return Err(Error::validation(format!(
            "VM name '{name}' contains invalid characters (allowed: alphanumeric, '.', '_', '-')"
        )));
    }
    Ok(())
}

/// Bridge names go into a comma-separated `virt-install` option.
fn validate_network(network: &str) -> Result<()> {
    if network.is_empty() || !network.chars().all(is_name_char) {
        return Err(Error::validation(format!("invalid network name '{network}'")));
    }
    Ok(())
}

/// Normalize the optional `connection` parameter.
pub fn connection_uri(connection: Option<&str>) -> Result<Option<&str>> {
    match connection.map(str::trim) {
        None => Ok(None),
        Some("") => Err(Error::validation("connection must not be empty")),
        Some(uri) if uri.chars().any(char::is_whitespace) => Err(Error::validation(format!(
            "connection URI '{uri}' must not contain whitespace"
        ))),
        Some(uri) => Ok(Some(uri)),
    }
}

fn in_range<T>(field: &str, value: T, range: &RangeInclusive<T>) -> Result<T>
where
    T: PartialOrd + std::fmt::Display,
{
    if !range.contains(&value) {
        return Err(Error::validation(format!(
            "{field} must be between {} and {}, got {value}",
            range.start(),
            range.end()
        )));
    }
    Ok(value)
}

fn non_empty(field: &str, value: String) -> Result<String> {
    if value.trim().is_empty() {
        return Err(Error::validation(format!("{field} must not be empty")));
    }
    Ok(value)
}

async fn require_file(what: &str, path: &Path) -> Result<()> {
    match tokio::fs::try_exists(path).await {
        Ok(true) => Ok(()),
        _ => Err(Error::validation(format!(
            "{what} {} does not exist",
            path.display()
        ))),
    }
}

/// Apply configured defaults to a `create_vm` request and check every value,
/// including that referenced files exist and the SSH key can be read.
pub async fn resolve_create(params: CreateVmParams, defaults: &VmConfig) -> Result<DomainSpec> {
    validate_vm_name(&params.name)?;

    let memory_mib = in_range(
        "memory",
        params.memory.unwrap_or(defaults.default_memory),
        &MEMORY_MIB_RANGE,
    )?;
    let vcpus = in_range(
        "vcpus",
        params.vcpus.unwrap_or(defaults.default_vcpus),
        &VCPU_RANGE,
    )?;
    let disk_size_gib = in_range(
        "disk_size",
        params.disk_size.unwrap_or(defaults.default_disk_size),
        &DISK_GIB_RANGE,
    )?;
    let os_variant = non_empty(
        "os_variant",
        params
            .os_variant
            .unwrap_or_else(|| defaults.default_os_variant.clone()),
    )?;
    let network = params
        .network
        .unwrap_or_else(|| defaults.default_network.clone());
    validate_network(&network)?;

    let source = match (params.master_image, params.cdrom) {
        (Some(_), Some(_)) => {
            return Err(Error::validation(
                "master_image and cdrom are mutually exclusive",
            ))
        }
        (Some(image), None) => {
            image_source(PathBuf::from(image), params.ignition, defaults).await?
        }
        (None, Some(iso)) => cdrom_source(PathBuf::from(iso), params.ignition.is_some()).await?,
        (None, None) => match (defaults.master_image(), defaults.iso()) {
            (Some(image), _) => {
                image_source(PathBuf::from(image), params.ignition, defaults).await?
            }
            (None, Some(iso)) => {
                cdrom_source(PathBuf::from(iso), params.ignition.is_some()).await?
            }
            (None, None) => {
                return Err(Error::validation(
                    "either master_image or cdrom is required (no default configured)",
                ))
            }
        },
    };

    Ok(DomainSpec {
        name: params.name,
        memory_mib,
        vcpus,
        disk_size_gib,
        os_variant,
        network,
        source,
    })
}

async fn image_source(
    image: PathBuf,
    ignition: Option<IgnitionParams>,
    defaults: &VmConfig,
) -> Result<InstallSource> {
    require_file("Master image", &image).await?;
    let ignition = resolve_ignition(ignition.unwrap_or_default(), defaults).await?;
    Ok(InstallSource::MasterImage {
        path: image,
        ignition,
    })
}

async fn cdrom_source(iso: PathBuf, has_ignition: bool) -> Result<InstallSource> {
    require_file("ISO image", &iso).await?;
    if has_ignition {
        warn!(iso = %iso.display(), "ignition settings are ignored for cdrom installs");
    }
    Ok(InstallSource::Cdrom { iso })
}

async fn resolve_ignition(params: IgnitionParams, defaults: &VmConfig) -> Result<IgnitionSpec> {
    let d = &defaults.ignition;
    let key_path = expand_home(params.ssh_key.as_deref().unwrap_or(&d.default_ssh_key));
    let spec = IgnitionSpec {
        hostname: params.hostname.unwrap_or_else(|| d.default_hostname.clone()),
        user: params.user.unwrap_or_else(|| d.default_user.clone()),
        ssh_authorized_key: load_ssh_key(&key_path).await?,
        timezone: params.timezone.unwrap_or_else(|| d.default_timezone.clone()),
        locale: params.locale.unwrap_or_else(|| d.default_locale.clone()),
        password_hash: params.password_hash.filter(|h| !h.is_empty()),
    };
    spec.validate()?;
    Ok(spec)
}
