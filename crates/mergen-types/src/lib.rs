//! Wire and on-disk document types shared by the mergen control plane and
//! the forwarder. Field names are pinned to the persisted JSON layout, so
//! every struct here is the schema of record for `meta.json`, `vm.json`,
//! `hooks.json` and the REST surface.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const HOOK_ON_CREATE: &str = "onCreate";
pub const HOOK_ON_DELETE: &str = "onDelete";
pub const HOOK_ON_START: &str = "onStart";
pub const HOOK_ON_STOP: &str = "onStop";

fn unix_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Body of `POST /v1/vms`. Numeric fields stay wide here; the lifecycle
/// service validates ranges so a bad port yields `bad_request` instead of a
/// body-decode rejection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVmRequest {
    #[serde(default)]
    pub rootfs: String,
    #[serde(default)]
    pub kernel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_disk: Option<String>,
    #[serde(default)]
    pub vcpu: i64,
    #[serde(default, rename = "memMiB")]
    pub mem_mib: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortBindingRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_args: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_env: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<HooksConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortBindingRequest {
    #[serde(default)]
    pub guest: i64,
    #[serde(default)]
    pub host: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub guest: u16,
    pub host: u16,
    pub protocol: String,
}

/// Derived absolute paths for one VM. Never authoritative on its own; the
/// store recomputes them from the configured roots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmPaths {
    #[serde(default)]
    pub config_dir: PathBuf,
    #[serde(default)]
    pub vm_config_path: PathBuf,
    #[serde(default)]
    pub meta_path: PathBuf,
    #[serde(default)]
    pub hooks_path: PathBuf,
    #[serde(default)]
    pub env_path: PathBuf,
    #[serde(default)]
    pub run_dir: PathBuf,
    #[serde(default)]
    pub socket_path: PathBuf,
    #[serde(default)]
    pub lock_path: PathBuf,
    #[serde(default)]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub logs_dir: PathBuf,
}

/// The persisted VM descriptor (`meta.json`). Presence of this document
/// defines existence of the VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmMetadata {
    pub id: String,
    #[serde(default = "unix_epoch")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub rootfs: String,
    #[serde(default)]
    pub kernel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_disk: Option<String>,
    #[serde(default)]
    pub ports: Vec<PortBinding>,
    #[serde(default, rename = "guestIP")]
    pub guest_ip: String,
    #[serde(default)]
    pub tap_name: String,
    #[serde(default)]
    pub netns: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<HashMap<String, String>>,
    #[serde(default)]
    pub paths: VmPaths,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<HooksConfig>,
}

impl Default for VmMetadata {
    fn default() -> Self {
        Self {
            id: String::new(),
            created_at: unix_epoch(),
            rootfs: String::new(),
            kernel: String::new(),
            data_disk: None,
            ports: Vec::new(),
            guest_ip: String::new(),
            tap_name: String::new(),
            netns: String::new(),
            http_port: None,
            metadata: None,
            tags: None,
            paths: VmPaths::default(),
            hooks: None,
        }
    }
}

/// One hook registration, discriminated by `type` on the wire. Exec argv
/// elements are `{{.field}}` templates over the serialized [`HookContext`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HookEntry {
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default, rename = "timeoutMs")]
        timeout_ms: u64,
        #[serde(default)]
        strict: bool,
    },
    Exec {
        #[serde(default)]
        cmd: Vec<String>,
        #[serde(default, rename = "timeoutMs")]
        timeout_ms: u64,
        #[serde(default)]
        strict: bool,
    },
}

impl HookEntry {
    pub fn timeout_ms(&self) -> u64 {
        match self {
            HookEntry::Http { timeout_ms, .. } | HookEntry::Exec { timeout_ms, .. } => *timeout_ms,
        }
    }

    pub fn is_strict(&self) -> bool {
        match self {
            HookEntry::Http { strict, .. } | HookEntry::Exec { strict, .. } => *strict,
        }
    }
}

/// Per-VM (`hooks.json`) or global hook lists, keyed by event name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HooksConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_create: Vec<HookEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_delete: Vec<HookEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_start: Vec<HookEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_stop: Vec<HookEntry>,
}

impl HooksConfig {
    pub fn is_empty(&self) -> bool {
        self.on_create.is_empty()
            && self.on_delete.is_empty()
            && self.on_start.is_empty()
            && self.on_stop.is_empty()
    }

    pub fn for_event(&self, event: &str) -> &[HookEntry] {
        match event {
            HOOK_ON_CREATE => &self.on_create,
            HOOK_ON_DELETE => &self.on_delete,
            HOOK_ON_START => &self.on_start,
            HOOK_ON_STOP => &self.on_stop,
            _ => &[],
        }
    }

    /// Appends all of `other`'s hook lists after this config's own entries.
    pub fn extend(&mut self, other: HooksConfig) {
        self.on_create.extend(other.on_create);
        self.on_delete.extend(other.on_delete);
        self.on_start.extend(other.on_start);
        self.on_stop.extend(other.on_stop);
    }
}

/// Snapshot handed to hooks: the JSON body of http hooks and the template
/// scope of exec hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookContext {
    pub id: String,
    pub host_ports: Vec<u16>,
    pub guest_ports: Vec<u16>,
    #[serde(rename = "guestIP")]
    pub guest_ip: String,
    pub created_at: DateTime<Utc>,
    pub paths: VmPaths,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub systemd: SystemdState,
    pub firecracker: FirecrackerState,
    pub network: NetworkState,
    pub paths: VmPaths,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemdState {
    pub available: bool,
    pub unit: String,
    pub active: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub active_state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub_state: String,
    #[serde(default, rename = "mainPID")]
    pub main_pid: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirecrackerState {
    pub socket_path: PathBuf,
    pub socket_present: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkState {
    #[serde(rename = "guestIP")]
    pub guest_ip: String,
    pub ports: Vec<PortBinding>,
    pub tap_name: String,
    pub netns: String,
}

/// Firecracker-shaped machine document (`vm.json`). Keys follow the
/// Firecracker API naming verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmConfig {
    #[serde(rename = "boot-source")]
    pub boot_source: BootSource,
    pub drives: Vec<Drive>,
    #[serde(rename = "machine-config")]
    pub machine_config: MachineConfig,
    #[serde(rename = "network-interfaces")]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vsock: Option<Vsock>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootSource {
    pub kernel_image_path: String,
    pub boot_args: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    pub smt: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vsock {
    pub vsock_id: String,
    pub guest_cid: u32,
    pub uds_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_tolerates_sparse_documents() {
        // The resolver reads descriptors it did not write; a minimal meta
        // must still parse and sort after real timestamps.
        let raw = r#"{
          "id": "084604f6-0766-4b7d-9d23-0b7a011d6eaa",
          "guestIP": "172.30.0.5",
          "netns": "mergen-084604f6",
          "tags": {"app": "app1"}
        }"#;
        let meta: VmMetadata = serde_json::from_str(raw).unwrap();
        assert_eq!(meta.guest_ip, "172.30.0.5");
        assert_eq!(meta.created_at, DateTime::<Utc>::UNIX_EPOCH);
        assert!(meta.ports.is_empty());
    }

    #[test]
    fn hook_entry_discriminates_on_type() {
        let raw = r#"[
          {"type": "http", "url": "http://127.0.0.1:9000/hook", "timeoutMs": 1500},
          {"type": "exec", "cmd": ["/bin/echo", "{{.id}}"], "strict": true}
        ]"#;
        let hooks: Vec<HookEntry> = serde_json::from_str(raw).unwrap();
        match &hooks[0] {
            HookEntry::Http { url, timeout_ms, strict, .. } => {
                assert_eq!(url, "http://127.0.0.1:9000/hook");
                assert_eq!(*timeout_ms, 1500);
                assert!(!strict);
            }
            other => panic!("expected http hook, got {other:?}"),
        }
        assert!(hooks[1].is_strict());
    }

    #[test]
    fn vm_config_uses_firecracker_key_names() {
        let cfg = VmConfig {
            boot_source: BootSource {
                kernel_image_path: "/t/vmlinux".into(),
                boot_args: "console=ttyS0".into(),
            },
            drives: vec![Drive {
                drive_id: "rootfs".into(),
                path_on_host: "/t/root.ext4".into(),
                is_root_device: true,
                is_read_only: false,
            }],
            machine_config: MachineConfig {
                vcpu_count: 1,
                mem_size_mib: 512,
                smt: false,
            },
            network_interfaces: vec![NetworkInterface {
                iface_id: "eth0".into(),
                host_dev_name: "tap-084604f6".into(),
                guest_mac: Some("02:FC:08:46:04:01".into()),
            }],
            vsock: None,
        };
        let value = serde_json::to_value(&cfg).unwrap();
        assert!(value.get("boot-source").is_some());
        assert!(value.get("machine-config").is_some());
        assert_eq!(value["drives"][0]["is_root_device"], true);
        assert!(value.get("vsock").is_none());
    }
}
