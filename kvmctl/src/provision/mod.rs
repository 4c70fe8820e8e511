//! Storage and domain definition artifacts for new VMs.
//!
//! Everything here is pure: it computes paths, command lines and XML. The
//! virsh session runs the commands and owns cleanup.

pub mod ignition;

use std::path::{Path, PathBuf};

use crate::hypervisor::DomainSpec;
use crate::util::xml_escape;

/// fw_cfg key Fedora CoreOS reads its Ignition config from.
pub const IGNITION_FW_CFG_KEY: &str = "opt/com.coreos/config";

/// Files created for one VM under the configured disk directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskLayout {
    pub disk: PathBuf,
    pub ignition: PathBuf,
    pub domain_xml: PathBuf,
}

impl DiskLayout {
    pub fn new(disk_dir: &Path, name: &str) -> Self {
        Self {
            disk: disk_dir.join(format!("{name}.qcow2")),
            ignition: disk_dir.join(format!("{name}.ign")),
            domain_xml: disk_dir.join(format!("{name}.xml")),
        }
    }

    pub fn all(&self) -> [&Path; 3] {
        [&self.disk, &self.ignition, &self.domain_xml]
    }
}

/// Arguments for a thin qcow2 overlay backed by `master`.
pub fn qemu_img_overlay_args(master: &Path, disk: &Path, size_gib: u64) -> Vec<String> {
    vec![
        "create".into(),
        "-f".into(),
        "qcow2".into(),
        "-F".into(),
        "qcow2".into(),
        "-b".into(),
        master.display().to_string(),
        disk.display().to_string(),
        format!("{size_gib}G"),
    ]
}

/// Arguments for installing from an ISO with `virt-install`.
pub fn virt_install_args(uri: &str, spec: &DomainSpec, disk: &Path, iso: &Path) -> Vec<String> {
    vec![
        "--connect".into(),
        uri.to_string(),
        "--name".into(),
        spec.name.clone(),
        "--memory".into(),
        spec.memory_mib.to_string(),
        "--vcpus".into(),
        spec.vcpus.to_string(),
        "--disk".into(),
        format!(
            "path={},size={},format=qcow2,bus=virtio",
            disk.display(),
            spec.disk_size_gib
        ),
        "--os-variant".into(),
        spec.os_variant.clone(),
        "--network".into(),
        format!("bridge={},model=virtio", spec.network),
        "--graphics".into(),
        "vnc,listen=0.0.0.0".into(),
        "--cdrom".into(),
        iso.display().to_string(),
        "--noautoconsole".into(),
        "--virt-type".into(),
        "kvm".into(),
    ]
}

/// libvirt domain XML for an Ignition-provisioned VM booting from `disk`.
pub fn render_domain_xml(spec: &DomainSpec, disk: &Path, ignition: &Path) -> String {
    let name = xml_escape(&spec.name);
    let disk = xml_escape(&disk.display().to_string());
    let bridge = xml_escape(&spec.network);
    let fw_cfg = xml_escape(&format!(
        "name={IGNITION_FW_CFG_KEY},file={}",
        ignition.display()
    ));
    let memory = spec.memory_mib;
    let vcpus = spec.vcpus;

    format!(
        r#"<domain type='kvm' xmlns:qemu='http://libvirt.org/schemas/domain/qemu/1.0'>
  <name>{name}</name>
  <memory unit='MiB'>{memory}</memory>
  <currentMemory unit='MiB'>{memory}</currentMemory>
  <vcpu placement='static'>{vcpus}</vcpu>
  <os>
    <type arch='x86_64' machine='q35'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <cpu mode='host-passthrough'/>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{disk}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <interface type='bridge'>
      <source bridge='{bridge}'/>
      <model type='virtio'/>
    </interface>
    <console type='pty'/>
    <graphics type='vnc' port='-1' autoport='yes' listen='0.0.0.0'>
      <listen type='address' address='0.0.0.0'/>
    </graphics>
    <video>
      <model type='virtio'/>
    </video>
  </devices>
  <qemu:commandline>
    <qemu:arg value='-fw_cfg'/>
    <qemu:arg value='{fw_cfg}'/>
  </qemu:commandline>
</domain>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::InstallSource;

    fn spec(name: &str) -> DomainSpec {
        DomainSpec {
            name: name.into(),
            memory_mib: 4096,
            vcpus: 4,
            disk_size_gib: 30,
            os_variant: "fedora-coreos-stable".into(),
            network: "brforvms".into(),
            source: InstallSource::Cdrom {
                iso: PathBuf::from("/iso/fcos.iso"),
            },
        }
    }

    #[test]
    fn test_disk_layout_paths() {
        let layout = DiskLayout::new(Path::new("/vm"), "puppy");
        assert_eq!(layout.disk, PathBuf::from("/vm/puppy.qcow2"));
        assert_eq!(layout.ignition, PathBuf::from("/vm/puppy.ign"));
        assert_eq!(layout.domain_xml, PathBuf::from("/vm/puppy.xml"));
    }

    #[test]
    fn test_qemu_img_overlay_args() {
        let args = qemu_img_overlay_args(
            Path::new("/vm/master.qcow2"),
            Path::new("/vm/puppy.qcow2"),
            20,
        );
        assert_eq!(
            args.join(" "),
            "create -f qcow2 -F qcow2 -b /vm/master.qcow2 /vm/puppy.qcow2 20G"
        );
    }

    #[test]
    fn test_virt_install_args() {
        let s = spec("puppy");
        let args = virt_install_args(
            "qemu:///system",
            &s,
            Path::new("/vm/puppy.qcow2"),
            Path::new("/iso/fcos.iso"),
        );
        let joined = args.join(" ");
        assert!(joined.starts_with("--connect qemu:///system --name puppy --memory 4096 --vcpus 4"));
        assert!(joined.contains("--disk path=/vm/puppy.qcow2,size=30,format=qcow2,bus=virtio"));
        assert!(joined.contains("--network bridge=brforvms,model=virtio"));
        assert!(joined.contains("--cdrom /iso/fcos.iso"));
        assert!(joined.ends_with("--noautoconsole --virt-type kvm"));
    }

    #[test]
    fn test_domain_xml_contents() {
        let xml = render_domain_xml(
            &spec("puppy"),
            Path::new("/vm/puppy.qcow2"),
            Path::new("/vm/puppy.ign"),
        );
        assert!(xml.contains("<domain type='kvm'"));
        assert!(xml.contains("<name>puppy</name>"));
        assert!(xml.contains("<memory unit='MiB'>4096</memory>"));
        assert!(xml.contains("<vcpu placement='static'>4</vcpu>"));
        assert!(xml.contains("machine='q35'"));
        assert!(xml.contains("<source file='/vm/puppy.qcow2'/>"));
        assert!(xml.contains("<target dev='vda' bus='virtio'/>"));
        assert!(xml.contains("<source bridge='brforvms'/>"));
        assert!(xml.contains("type='vnc'"));
        assert!(xml.contains("listen='0.0.0.0'"));
        assert!(xml.contains("name=opt/com.coreos/config,file=/vm/puppy.ign"));
    }

    #[test]
    fn test_domain_xml_escapes_values() {
        let mut s = spec("puppy");
        s.network = "br'0<x>".into();
        let xml = render_domain_xml(&s, Path::new("/vm/a&b.qcow2"), Path::new("/vm/p.ign"));
        assert!(xml.contains("<source bridge='br&apos;0&lt;x&gt;'/>"));
        assert!(xml.contains("<source file='/vm/a&amp;b.qcow2'/>"));
        assert!(!xml.contains("br'0"));
    }
}
