use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use mergen_types::{
    CreateVmRequest, FirecrackerState, HookContext, HookEntry, HooksConfig, NetworkState,
    SystemdState, VmMetadata, VmSummary, HOOK_ON_CREATE, HOOK_ON_DELETE, HOOK_ON_START,
    HOOK_ON_STOP,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::allocator::Allocator;
use crate::core::firecracker;
use crate::core::hooks::HookRunner;
use crate::core::lock::{LockError, VmLock};
use crate::core::systemd::{Status, SystemdClient, SystemdError};
use crate::features::vms::store::{FsStore, StoreError};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not found")]
    NotFound,
    #[error("state conflict: another operation holds the vm lock")]
    Conflict,
    #[error("host dependency unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ServiceError::NotFound,
            StoreError::InvalidId => ServiceError::InvalidRequest("vm id is invalid".into()),
            other => ServiceError::Internal(anyhow::Error::new(other)),
        }
    }
}

fn map_systemd_err(err: SystemdError) -> ServiceError {
    match err {
        SystemdError::Unavailable | SystemdError::UnitNotFound(_) => {
            ServiceError::Unavailable(err.to_string())
        }
        other => ServiceError::Internal(anyhow::Error::new(other)),
    }
}

/// Lifecycle orchestrator: validates requests, allocates resources,
/// persists state, and coordinates the supervisor and hooks. All
/// state-changing operations on one VM are serialized by its advisory lock.
pub struct Service {
    store: FsStore,
    systemd: Arc<dyn SystemdClient>,
    hooks: HookRunner,
    allocator: Allocator,
}

impl Service {
    pub fn new(
        store: FsStore,
        systemd: Arc<dyn SystemdClient>,
        hooks: HookRunner,
        allocator: Allocator,
    ) -> Service {
        Service {
            store,
            systemd,
            hooks,
            allocator,
        }
    }

    pub async fn create(&self, req: CreateVmRequest) -> Result<String, ServiceError> {
        debug!(
            rootfs = %req.rootfs,
            kernel = %req.kernel,
            vcpu = req.vcpu,
            mem_mib = req.mem_mib,
            port_requests = req.ports.len(),
            auto_start = req.auto_start,
            "create vm request received"
        );

        validate_create(&req)?;
        validate_backing_file(&req.rootfs, "rootfs")?;
        validate_backing_file(&req.kernel, "kernel")?;
        let data_disk = req
            .data_disk
            .as_deref()
            .map(str::trim)
            .filter(|disk| !disk.is_empty())
            .map(str::to_string);
        if let Some(disk) = data_disk.as_deref() {
            validate_backing_file(disk, "dataDisk")?;
        }

        let existing = self.store.list_metas()?;
        let (guest_ip, ports) = self
            .allocator
            .allocate(&existing, &req.ports)
            .map_err(|err| {
                debug!(error = %err, "resource allocation failed");
                ServiceError::InvalidRequest(err.to_string())
            })?;
        debug!(guest_ip = %guest_ip, allocated_ports = ports.len(), "resource allocation completed");

        let id = Uuid::new_v4().to_string();
        let meta = VmMetadata {
            id: id.clone(),
            created_at: Utc::now(),
            rootfs: req.rootfs.clone(),
            kernel: req.kernel.clone(),
            data_disk,
            ports,
            guest_ip,
            tap_name: crate::core::allocator::tap_name(&id),
            netns: crate::core::allocator::netns_name(&id),
            http_port: req.http_port.map(|port| port as u16),
            metadata: req.metadata.clone(),
            tags: req.tags.clone(),
            paths: self.store.paths_for(&id),
            hooks: req.hooks.clone(),
        };

        let vm_config = firecracker::render_vm_config(&req, &meta);
        let hooks_config = req.hooks.clone().unwrap_or_default();
        let env = base_env(&meta, req.extra_env.as_ref());

        if let Err(err) = self.store.save(&id, &vm_config, &meta, &hooks_config, &env) {
            error!(vm_id = %id, error = %err, "failed to persist vm files");
            // meta.json is written last, so nothing readable as a VM can
            // survive a partial save.
            let _ = std::fs::remove_dir_all(&meta.paths.config_dir);
            return Err(err.into());
        }
        debug!(vm_id = %id, config_dir = %meta.paths.config_dir.display(), "vm files persisted");

        self.trigger_hooks(HOOK_ON_CREATE, &meta, None);

        if req.auto_start {
            debug!(vm_id = %id, "auto-start enabled, starting vm");
            self.start(&id).await?;
        }

        info!(vm_id = %id, guest_ip = %meta.guest_ip, published_ports = meta.ports.len(), "vm created");
        Ok(id)
    }

    pub async fn start(&self, id: &str) -> Result<(), ServiceError> {
        let id = id.trim();
        debug!(vm_id = %id, "start vm requested");
        if id.is_empty() {
            return Err(ServiceError::InvalidRequest("id is empty".into()));
        }
        if !self.store.exists(id)? {
            return Err(ServiceError::NotFound);
        }

        let _lock = self.lock_vm(id)?;

        // Consulting is-active first keeps a repeated start from re-firing
        // the supervisor and the onStart hooks.
        if self.systemd.is_active(id).await.map_err(map_systemd_err)? {
            debug!(vm_id = %id, "unit already active, start is a no-op");
            return Ok(());
        }
        self.systemd.start(id).await.map_err(map_systemd_err)?;

        if let Ok(meta) = self.store.read_meta(id) {
            self.trigger_hooks(HOOK_ON_START, &meta, None);
        }
        info!(vm_id = %id, "vm started");
        Ok(())
    }

    pub async fn stop(&self, id: &str) -> Result<(), ServiceError> {
        let id = id.trim();
        debug!(vm_id = %id, "stop vm requested");
        if id.is_empty() {
            return Err(ServiceError::InvalidRequest("id is empty".into()));
        }
        if !self.store.exists(id)? {
            return Err(ServiceError::NotFound);
        }

        let _lock = self.lock_vm(id)?;

        if !self.systemd.is_active(id).await.map_err(map_systemd_err)? {
            debug!(vm_id = %id, "unit already inactive, stop is a no-op");
            return Ok(());
        }
        self.systemd.stop(id).await.map_err(map_systemd_err)?;

        if let Ok(meta) = self.store.read_meta(id) {
            self.trigger_hooks(HOOK_ON_STOP, &meta, None);
        }
        info!(vm_id = %id, "vm stopped");
        Ok(())
    }

    pub async fn delete(&self, id: &str, retain_data: bool) -> Result<(), ServiceError> {
        let id = id.trim();
        debug!(vm_id = %id, retain_data, "delete vm requested");
        if id.is_empty() {
            return Err(ServiceError::InvalidRequest("id is empty".into()));
        }
        if !self.store.exists(id)? {
            return Err(ServiceError::NotFound);
        }

        let _lock = self.lock_vm(id)?;

        let meta = match self.store.read_meta(id) {
            Ok(meta) => meta,
            Err(StoreError::NotFound) => return Err(ServiceError::NotFound),
            Err(err) => return Err(err.into()),
        };
        // Read the hook config before the files go away so onDelete hooks
        // still see them.
        let vm_hooks = match self.store.read_hooks(id) {
            Ok(hooks) => hooks,
            Err(err) => {
                warn!(vm_id = %id, error = %err, "read vm hooks before delete failed");
                HooksConfig::default()
            }
        };

        match self.systemd.stop(id).await {
            Ok(()) | Err(SystemdError::Unavailable) => {}
            Err(err) => warn!(vm_id = %id, error = %err, "stop unit before delete failed"),
        }
        match self.systemd.disable(id).await {
            Ok(()) | Err(SystemdError::Unavailable) => {}
            Err(err) => warn!(vm_id = %id, error = %err, "disable unit before delete failed"),
        }

        self.store.delete(id, retain_data).map_err(|err| match err {
            StoreError::NotFound => ServiceError::NotFound,
            other => other.into(),
        })?;

        self.trigger_hooks(HOOK_ON_DELETE, &meta, Some(vm_hooks));
        info!(vm_id = %id, retain_data, "vm deleted");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<VmSummary, ServiceError> {
        let id = id.trim();
        debug!(vm_id = %id, "get vm requested");
        if id.is_empty() {
            return Err(ServiceError::InvalidRequest("id is empty".into()));
        }

        let meta = match self.store.read_meta(id) {
            Ok(meta) => meta,
            Err(StoreError::NotFound) => return Err(ServiceError::NotFound),
            Err(err) => return Err(err.into()),
        };

        let status = match self.systemd.status(id).await {
            Ok(status) => status,
            Err(SystemdError::Unavailable) => Status::default(),
            Err(err) => return Err(ServiceError::Internal(anyhow::Error::new(err))),
        };

        let socket_present = firecracker::socket_present(&meta.paths.socket_path)
            .map_err(|err| ServiceError::Internal(anyhow::Error::new(err)))?;
        debug!(
            vm_id = %id,
            systemd_active = status.active,
            socket_present,
            "vm status collected"
        );

        Ok(VmSummary {
            id: meta.id.clone(),
            created_at: meta.created_at,
            systemd: SystemdState {
                available: status.available,
                unit: status.unit,
                active: status.active,
                active_state: status.active_state,
                sub_state: status.sub_state,
                main_pid: status.main_pid,
            },
            firecracker: FirecrackerState {
                socket_path: meta.paths.socket_path.clone(),
                socket_present,
            },
            network: NetworkState {
                guest_ip: meta.guest_ip.clone(),
                ports: meta.ports.clone(),
                tap_name: meta.tap_name.clone(),
                netns: meta.netns.clone(),
            },
            paths: meta.paths,
            metadata: meta.metadata,
        })
    }

    pub async fn list(&self) -> Result<Vec<VmSummary>, ServiceError> {
        debug!("list vms requested");
        let ids = self.store.list_ids()?;

        let mut result = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(&id).await {
                Ok(summary) => result.push(summary),
                Err(ServiceError::NotFound) => continue,
                Err(err) => return Err(err),
            }
        }

        result.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        debug!(count = result.len(), "list vms completed");
        Ok(result)
    }

    fn lock_vm(&self, id: &str) -> Result<VmLock, ServiceError> {
        let lock_path = self.store.paths_for(id).lock_path;
        debug!(vm_id = %id, lock_path = %lock_path.display(), "acquiring vm lock");
        match VmLock::acquire(&lock_path) {
            Ok(lock) => Ok(lock),
            Err(LockError::AlreadyLocked) => {
                debug!(vm_id = %id, lock_path = %lock_path.display(), "vm lock already held");
                Err(ServiceError::Conflict)
            }
            Err(LockError::Io(err)) => Err(ServiceError::Internal(
                anyhow::Error::new(err).context("acquire vm lock"),
            )),
        }
    }

    fn trigger_hooks(&self, event: &str, meta: &VmMetadata, vm_hooks_override: Option<HooksConfig>) {
        let vm_hooks = vm_hooks_override.unwrap_or_else(|| match self.store.read_hooks(&meta.id) {
            Ok(hooks) => hooks,
            Err(err) => {
                warn!(vm_id = %meta.id, error = %err, "read vm hooks failed");
                HooksConfig::default()
            }
        });
        let global_hooks = match self.store.read_global_hooks() {
            Ok(hooks) => hooks,
            Err(err) => {
                warn!(vm_id = %meta.id, error = %err, "read global hooks failed");
                HooksConfig::default()
            }
        };

        let mut entries: Vec<HookEntry> = global_hooks.for_event(event).to_vec();
        entries.extend_from_slice(vm_hooks.for_event(event));
        debug!(vm_id = %meta.id, event = %event, hook_count = entries.len(), "triggering hooks");
        self.hooks.run_async(event, entries, hook_context(meta));
    }
}

fn hook_context(meta: &VmMetadata) -> HookContext {
    HookContext {
        id: meta.id.clone(),
        host_ports: meta.ports.iter().map(|p| p.host).collect(),
        guest_ports: meta.ports.iter().map(|p| p.guest).collect(),
        guest_ip: meta.guest_ip.clone(),
        created_at: meta.created_at,
        paths: meta.paths.clone(),
        metadata: meta.metadata.clone(),
    }
}

fn base_env(meta: &VmMetadata, extra: Option<&HashMap<String, String>>) -> HashMap<String, String> {
    let paths = &meta.paths;
    let mut env = HashMap::from([
        ("MGN_VM_ID".to_string(), meta.id.clone()),
        ("MGN_CONFIG_DIR".to_string(), display(&paths.config_dir)),
        ("MGN_VM_JSON".to_string(), display(&paths.vm_config_path)),
        ("MGN_META_JSON".to_string(), display(&paths.meta_path)),
        ("MGN_HOOKS_JSON".to_string(), display(&paths.hooks_path)),
        ("MGN_RUN_DIR".to_string(), display(&paths.run_dir)),
        ("MGN_SOCKET_PATH".to_string(), display(&paths.socket_path)),
        ("MGN_TAP_NAME".to_string(), meta.tap_name.clone()),
        ("MGN_NETNS".to_string(), meta.netns.clone()),
        ("MGN_GUEST_IP".to_string(), meta.guest_ip.clone()),
        ("MGN_DATA_DIR".to_string(), display(&paths.data_dir)),
        ("MGN_LOG_DIR".to_string(), display(&paths.logs_dir)),
    ]);

    if let Some(port) = meta.http_port {
        env.insert("MGN_HTTP_PORT".to_string(), port.to_string());
    }
    for binding in &meta.ports {
        env.insert(
            format!("MGN_PUBLISH_{}", binding.guest),
            format!("{}/{}", binding.host, binding.protocol),
        );
    }
    if let Some(extra) = extra {
        for (key, value) in extra {
            if key.trim().is_empty() {
                continue;
            }
            env.insert(key.clone(), value.clone());
        }
    }
    env
}

fn display(path: &std::path::Path) -> String {
    path.display().to_string()
}

fn validate_create(req: &CreateVmRequest) -> Result<(), ServiceError> {
    if req.rootfs.trim().is_empty() {
        return Err(ServiceError::InvalidRequest("rootfs is required".into()));
    }
    if req.kernel.trim().is_empty() {
        return Err(ServiceError::InvalidRequest("kernel is required".into()));
    }
    if req.vcpu <= 0 {
        return Err(ServiceError::InvalidRequest("vcpu must be > 0".into()));
    }
    if req.mem_mib < 128 {
        return Err(ServiceError::InvalidRequest("memMiB must be >= 128".into()));
    }
    for port in &req.ports {
        if port.guest <= 0 || port.guest > 65535 {
            return Err(ServiceError::InvalidRequest(format!(
                "invalid guest port: {}",
                port.guest
            )));
        }
        if port.host < 0 || port.host > 65535 {
            return Err(ServiceError::InvalidRequest(format!(
                "invalid host port: {}",
                port.host
            )));
        }
    }
    if let Some(http_port) = req.http_port {
        if http_port <= 0 || http_port > 65535 {
            return Err(ServiceError::InvalidRequest(format!(
                "invalid httpPort: {http_port}"
            )));
        }
    }
    Ok(())
}

fn validate_backing_file(path: &str, field: &str) -> Result<(), ServiceError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(ServiceError::InvalidRequest(format!(
            "{field} {path} is not a regular file"
        ))),
        Err(err) => Err(ServiceError::InvalidRequest(format!(
            "{field} {path}: {err}"
        ))),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory supervisor double recording call counts, mirroring the
    /// is-active short-circuit contract of the real client.
    #[derive(Default)]
    pub struct FakeSystemd {
        active: Mutex<StdHashMap<String, bool>>,
        pub start_calls: AtomicUsize,
        pub stop_calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl SystemdClient for FakeSystemd {
        async fn start(&self, id: &str) -> Result<(), SystemdError> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            self.active.lock().unwrap().insert(id.to_string(), true);
            Ok(())
        }

        async fn stop(&self, id: &str) -> Result<(), SystemdError> {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            self.active.lock().unwrap().insert(id.to_string(), false);
            Ok(())
        }

        async fn disable(&self, _id: &str) -> Result<(), SystemdError> {
            Ok(())
        }

        async fn is_active(&self, id: &str) -> Result<bool, SystemdError> {
            Ok(*self.active.lock().unwrap().get(id).unwrap_or(&false))
        }

        async fn status(&self, id: &str) -> Result<Status, SystemdError> {
            let active = *self.active.lock().unwrap().get(id).unwrap_or(&false);
            Ok(Status {
                available: true,
                unit: format!("mergen@{id}.service"),
                active,
                active_state: if active { "active" } else { "inactive" }.to_string(),
                sub_state: "running".to_string(),
                main_pid: 1234,
            })
        }
    }

    pub struct TestEnv {
        pub service: Service,
        pub systemd: Arc<FakeSystemd>,
        pub store: FsStore,
        pub rootfs: String,
        pub kernel: String,
    }

    pub fn test_env(base: &Path) -> TestEnv {
        let new_store = || {
            FsStore::new(
                base.join("etc/mergen/vm.d"),
                base.join("var/lib/mergen"),
                base.join("run/mergen"),
                base.join("etc/mergen/hooks.d"),
            )
        };
        let store = new_store();
        store.ensure_base_dirs().unwrap();

        let rootfs = base.join("rootfs.ext4");
        let kernel = base.join("vmlinux");
        std::fs::write(&rootfs, b"x").unwrap();
        std::fs::write(&kernel, b"x").unwrap();

        let systemd = Arc::new(FakeSystemd::default());
        let service = Service::new(
            new_store(),
            systemd.clone(),
            HookRunner::new(),
            Allocator::new(20000, 20010, "172.30.0.0/24"),
        );

        TestEnv {
            service,
            systemd,
            store,
            rootfs: rootfs.display().to_string(),
            kernel: kernel.display().to_string(),
        }
    }

    pub fn minimal_request(env: &TestEnv) -> CreateVmRequest {
        CreateVmRequest {
            rootfs: env.rootfs.clone(),
            kernel: env.kernel.clone(),
            vcpu: 1,
            mem_mib: 512,
            ports: vec![mergen_types::PortBindingRequest {
                guest: 8080,
                host: 0,
                protocol: None,
            }],
            ..CreateVmRequest::default()
        }
    }
}
