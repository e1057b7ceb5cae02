use std::collections::HashMap;
use std::fs::{DirBuilder, OpenOptions, Permissions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use mergen_types::{HooksConfig, VmConfig, VmMetadata, VmPaths};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("vm not found")]
    NotFound,
    #[error("vm id is invalid")]
    InvalidId,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid json in {}: {}", .path.display(), .source)]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Filesystem-backed VM store. Exclusively owns the on-disk layout; the
/// lifecycle service is the only writer. `meta.json` presence defines VM
/// existence, so it is always the last artifact written.
pub struct FsStore {
    config_root: PathBuf,
    data_root: PathBuf,
    run_root: PathBuf,
    hooks_root: PathBuf,
}

impl FsStore {
    pub fn new(
        config_root: impl Into<PathBuf>,
        data_root: impl Into<PathBuf>,
        run_root: impl Into<PathBuf>,
        hooks_root: impl Into<PathBuf>,
    ) -> FsStore {
        FsStore {
            config_root: config_root.into(),
            data_root: data_root.into(),
            run_root: run_root.into(),
            hooks_root: hooks_root.into(),
        }
    }

    pub fn ensure_base_dirs(&self) -> Result<(), StoreError> {
        debug!(
            config_root = %self.config_root.display(),
            data_root = %self.data_root.display(),
            run_root = %self.run_root.display(),
            "ensuring store base directories"
        );
        for dir in [&self.config_root, &self.data_root, &self.run_root] {
            create_dir_all_mode(dir)?;
        }
        Ok(())
    }

    pub fn paths_for(&self, id: &str) -> VmPaths {
        let config_dir = self.config_root.join(id);
        let data_dir = self.data_root.join(id);
        let run_dir = self.run_root.join(id);

        VmPaths {
            vm_config_path: config_dir.join("vm.json"),
            meta_path: config_dir.join("meta.json"),
            hooks_path: config_dir.join("hooks.json"),
            env_path: config_dir.join("env"),
            socket_path: run_dir.join("firecracker.socket"),
            lock_path: self.run_root.join(format!("{id}.lock")),
            logs_dir: data_dir.join("logs"),
            config_dir,
            run_dir,
            data_dir,
        }
    }

    /// Persists every VM artifact. Directories are created 0750, files are
    /// written atomically with mode 0640, `meta.json` last.
    pub fn save(
        &self,
        id: &str,
        vm_config: &VmConfig,
        meta: &VmMetadata,
        hooks: &HooksConfig,
        env: &HashMap<String, String>,
    ) -> Result<VmPaths, StoreError> {
        validate_id(id)?;
        debug!(
            vm_id = %id,
            ports = meta.ports.len(),
            has_hooks = !hooks.is_empty(),
            env_count = env.len(),
            "saving vm artifacts"
        );

        let paths = self.paths_for(id);
        let mut meta = meta.clone();
        meta.paths = paths.clone();

        for dir in [&paths.config_dir, &paths.run_dir, &paths.data_dir, &paths.logs_dir] {
            create_dir_all_mode(dir)?;
        }

        write_json_atomic(&paths.vm_config_path, vm_config)?;
        if !hooks.is_empty() {
            write_json_atomic(&paths.hooks_path, hooks)?;
        }
        if !env.is_empty() {
            write_atomic(&paths.env_path, encode_env(env).as_bytes())?;
        }
        write_json_atomic(&paths.meta_path, &meta)?;

        debug!(vm_id = %id, config_dir = %paths.config_dir.display(), "vm artifacts saved");
        Ok(paths)
    }

    pub fn exists(&self, id: &str) -> Result<bool, StoreError> {
        validate_id(id)?;
        match std::fs::metadata(self.paths_for(id).meta_path) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub fn read_meta(&self, id: &str) -> Result<VmMetadata, StoreError> {
        validate_id(id)?;
        read_json_opt(&self.paths_for(id).meta_path)?.ok_or(StoreError::NotFound)
    }

    pub fn read_vm_config(&self, id: &str) -> Result<VmConfig, StoreError> {
        validate_id(id)?;
        read_json_opt(&self.paths_for(id).vm_config_path)?.ok_or(StoreError::NotFound)
    }

    /// A missing `hooks.json` is not an error; most VMs have no hooks.
    pub fn read_hooks(&self, id: &str) -> Result<HooksConfig, StoreError> {
        validate_id(id)?;
        Ok(read_json_opt(&self.paths_for(id).hooks_path)?.unwrap_or_default())
    }

    /// Concatenates every `*.json` file under the global hooks root,
    /// appending per-event lists in file-name order.
    pub fn read_global_hooks(&self) -> Result<HooksConfig, StoreError> {
        let mut merged = HooksConfig::default();
        let entries = match std::fs::read_dir(&self.hooks_root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(merged),
            Err(err) => return Err(err.into()),
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        for path in files {
            let hooks: HooksConfig = read_json_opt(&path)?.unwrap_or_default();
            merged.extend(hooks);
        }

        debug!(
            on_create = merged.on_create.len(),
            on_delete = merged.on_delete.len(),
            on_start = merged.on_start.len(),
            on_stop = merged.on_stop.len(),
            "global hooks loaded"
        );
        Ok(merged)
    }

    pub fn list_ids(&self) -> Result<Vec<String>, StoreError> {
        let entries = match std::fs::read_dir(&self.config_root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Reads every descriptor, tolerating VMs deleted mid-enumeration.
    pub fn list_metas(&self) -> Result<Vec<VmMetadata>, StoreError> {
        let mut metas = Vec::new();
        for id in self.list_ids()? {
            match self.read_meta(&id) {
                Ok(meta) => metas.push(meta),
                Err(StoreError::NotFound) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(metas)
    }

    pub fn delete(&self, id: &str, retain_data: bool) -> Result<(), StoreError> {
        validate_id(id)?;
        debug!(vm_id = %id, retain_data, "deleting vm from store");

        if !self.exists(id)? {
            return Err(StoreError::NotFound);
        }

        let paths = self.paths_for(id);
        remove_dir_all_if_present(&paths.config_dir)?;
        remove_dir_all_if_present(&paths.run_dir)?;
        if !retain_data {
            remove_dir_all_if_present(&paths.data_dir)?;
        }
        debug!(vm_id = %id, "vm deleted from store");
        Ok(())
    }
}

fn validate_id(id: &str) -> Result<(), StoreError> {
    if id.trim().is_empty() || id.contains('/') || id.contains("..") {
        return Err(StoreError::InvalidId);
    }
    Ok(())
}

fn create_dir_all_mode(dir: &Path) -> std::io::Result<()> {
    DirBuilder::new().recursive(true).mode(0o750).create(dir)
}

fn remove_dir_all_if_present(dir: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, payload: &T) -> Result<(), StoreError> {
    let mut content = serde_json::to_vec_pretty(payload).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    content.push(b'\n');
    write_atomic(path, &content)
}

/// Writes to a sibling temp file, fixes the mode, then renames over the
/// target so readers only ever observe complete documents.
fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    create_dir_all_mode(dir)?;

    let tmp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));
    let result = (|| {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o640)
            .open(&tmp_path)?;
        file.write_all(content)?;
        file.set_permissions(Permissions::from_mode(0o640))?;
        drop(file);
        std::fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result.map_err(StoreError::Io)
}

fn read_json_opt<T: DeserializeOwned + Default>(path: &Path) -> Result<Option<T>, StoreError> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if content.is_empty() {
        return Ok(Some(T::default()));
    }
    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })
}

/// `KEY='value'` lines, keys sorted, single quotes escaped shell-style.
fn encode_env(env: &HashMap<String, String>) -> String {
    let mut keys: Vec<&String> = env.keys().collect();
    keys.sort();

    let mut out = String::new();
    for key in keys {
        out.push_str(key);
        out.push('=');
        out.push_str(&shell_escape(&env[key]));
        out.push('\n');
    }
    out
}

fn shell_escape(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}
