use std::net::Ipv4Addr;
use std::path::Path;

use mergen_types::{
    BootSource, CreateVmRequest, Drive, MachineConfig, NetworkInterface, VmConfig, VmMetadata,
};

use crate::core::allocator;

const DEFAULT_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";
const DEFAULT_GUEST_NETMASK: &str = "255.255.255.0";
const GUEST_IFACE: &str = "eth0";

/// Renders the Firecracker-shaped machine document persisted as `vm.json`.
pub fn render_vm_config(req: &CreateVmRequest, meta: &VmMetadata) -> VmConfig {
    let mut drives = vec![Drive {
        drive_id: "rootfs".into(),
        path_on_host: req.rootfs.clone(),
        is_root_device: true,
        is_read_only: false,
    }];

    if let Some(data_disk) = req
        .data_disk
        .as_deref()
        .map(str::trim)
        .filter(|disk| !disk.is_empty())
    {
        drives.push(Drive {
            drive_id: "data".into(),
            path_on_host: data_disk.to_string(),
            is_root_device: false,
            is_read_only: false,
        });
    }

    VmConfig {
        boot_source: BootSource {
            kernel_image_path: req.kernel.clone(),
            boot_args: resolved_boot_args(req.boot_args.as_deref(), &meta.guest_ip),
        },
        drives,
        machine_config: MachineConfig {
            vcpu_count: req.vcpu as u32,
            mem_size_mib: req.mem_mib as u32,
            smt: false,
        },
        network_interfaces: vec![NetworkInterface {
            iface_id: GUEST_IFACE.into(),
            host_dev_name: meta.tap_name.clone(),
            guest_mac: Some(allocator::guest_mac(&meta.id)),
        }],
        vsock: None,
    }
}

fn resolved_boot_args(requested: Option<&str>, guest_ip: &str) -> String {
    let mut boot_args = requested.map(str::trim).unwrap_or_default().to_string();
    if boot_args.is_empty() {
        boot_args = DEFAULT_BOOT_ARGS.to_string();
    }

    if !has_kernel_arg_with_prefix(&boot_args, "ip=") {
        if let Some(ip_arg) = kernel_ip_arg(guest_ip) {
            boot_args.push(' ');
            boot_args.push_str(&ip_arg);
        }
    }

    boot_args.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn has_kernel_arg_with_prefix(boot_args: &str, prefix: &str) -> bool {
    boot_args
        .split_whitespace()
        .any(|arg| arg.starts_with(prefix))
}

/// Kernel-style `ip=` argument. The gateway is the guest's /24 network with
/// the last octet 1, or 2 when the guest itself owns .1.
fn kernel_ip_arg(guest_ip: &str) -> Option<String> {
    let addr: Ipv4Addr = guest_ip.trim().parse().ok()?;
    let octets = addr.octets();
    let gateway_last = if octets[3] == 1 { 2 } else { 1 };
    let gateway = Ipv4Addr::new(octets[0], octets[1], octets[2], gateway_last);
    Some(format!(
        "ip={addr}::{gateway}:{DEFAULT_GUEST_NETMASK}::{GUEST_IFACE}:off"
    ))
}

/// Whether the Firecracker API socket exists and actually is a socket file.
pub fn socket_present(path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::FileTypeExt;

    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.file_type().is_socket()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}
