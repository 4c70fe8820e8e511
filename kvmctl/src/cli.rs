//! `kvmctl check`: verify the host and hypervisor before running `serve`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::hypervisor::virsh::{VirshConnector, VirshSettings};
use crate::util::expand_home;

pub fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    Config::load(config_path.as_deref()).context("loading configuration")
}

struct Check {
    label: &'static str,
    ok: bool,
    detail: String,
    fix: Option<String>,
}

impl Check {
    fn pass(label: &'static str, detail: impl Into<String>) -> Self {
        Self { label, ok: true, detail: detail.into(), fix: None }
    }

    fn fail(label: &'static str, detail: impl Into<String>, fix: impl Into<String>) -> Self {
        Self { label, ok: false, detail: detail.into(), fix: Some(fix.into()) }
    }
}

/// Returns `Ok(())` if every check passes.
pub async fn run_check(config: Config) -> Result<()> {
    println!("Checking {}...\n", config.hypervisor.uri);

    let checks = vec![
        check_tool("virsh", &config.hypervisor.virsh_binary, "apt install libvirt-clients"),
        check_tool("qemu-img", &config.hypervisor.qemu_img_binary, "apt install qemu-utils"),
        check_tool(
            "virt-install",
            &config.hypervisor.virt_install_binary,
            "apt install virtinst",
        ),
        check_disk_dir(&config.vm.disk_path),
        check_master_image(config.vm.master_image()),
        check_ssh_key(&config.vm.ignition.default_ssh_key),
        check_hypervisor(config).await,
    ];

    for c in &checks {
        let icon = if c.ok { "\u{2713}" } else { "\u{2717}" };
        println!("  {} {} ({})", icon, c.label, c.detail);
        if let (false, Some(fix)) = (c.ok, &c.fix) {
            println!("    Fix: {}", fix);
        }
    }

    println!();
    let failed = checks.iter().filter(|c| !c.ok).count();
    if failed == 0 {
        println!("All checks passed.");
        Ok(())
    } else {
        anyhow::bail!("{} check(s) failed", failed)
    }
}

fn check_tool(label: &'static str, binary: &str, fix: &str) -> Check {
    match std::process::Command::new(binary).arg("--version").output() {
        Ok(out) if out.status.success() => {
            let version = String::from_utf8_lossy(&out.stdout);
            let version = version.lines().next().unwrap_or("unknown").trim();
            Check::pass(label, format!("{binary} {version}"))
        }
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            Check::fail(
                label,
                format!("{binary} exited with error: {}", stderr.trim()),
                format!("Install it: {fix}"),
            )
        }
        Err(e) => Check::fail(
            label,
            format!("{binary} not found: {e}"),
            format!("Install it: {fix}"),
        ),
    }
}

fn check_disk_dir(dir: &Path) -> Check {
    if dir.is_dir() {
        Check::pass("Disk directory", dir.display().to_string())
    } else {
        Check::fail(
            "Disk directory",
            format!("{} does not exist", dir.display()),
            format!("mkdir -p {}", dir.display()),
        )
    }
}

fn check_master_image(image: Option<&str>) -> Check {
    match image {
        None => Check::pass("Master image", "not configured; requests must name one"),
        Some(path) if Path::new(path).is_file() => Check::pass("Master image", path),
        Some(path) => Check::fail(
            "Master image",
            format!("{path} does not exist"),
            "Set vm.default_master_image to an existing qcow2 image",
        ),
    }
}

fn check_ssh_key(path: &str) -> Check {
    let expanded = expand_home(path);
    match std::fs::read_to_string(&expanded) {
        Ok(key) if !key.trim().is_empty() => {
            Check::pass("SSH key", expanded.display().to_string())
        }
        Ok(_) => Check::fail(
            "SSH key",
            format!("{} is empty", expanded.display()),
            "Point vm.ignition.default_ssh_key at a public key",
        ),
        Err(e) => Check::fail(
            "SSH key",
            format!("{}: {e}", expanded.display()),
            "Generate one with ssh-keygen or set vm.ignition.default_ssh_key",
        ),
    }
}

async fn check_hypervisor(config: Config) -> Check {
    let connector = Arc::new(VirshConnector::new(VirshSettings::from_config(&config)));
    let dispatcher = Dispatcher::new(Arc::new(config), connector, None);
    let uri = dispatcher.default_uri().to_string();
    let result = dispatcher.probe().await;
    dispatcher.close().await;
    match result {
        Ok(n) => Check::pass("Hypervisor", format!("{uri}: {n} domain(s)")),
        Err(e) => Check::fail(
            "Hypervisor",
            e.to_string(),
            "Check that libvirtd is running and this user may connect to it",
        ),
    }
}
