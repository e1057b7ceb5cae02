use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use mergen_types::VmMetadata;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("tls server name is empty")]
    EmptyServerName,
    #[error("server name must end with {0}")]
    WrongDomain(String),
    #[error("invalid server name label in {0}")]
    InvalidLabel(String),
    #[error("no vm matches {0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct Cache {
    valid_until: Option<Instant>,
    by_alias: HashMap<String, VmMetadata>,
    ordered: Vec<VmMetadata>,
}

/// TTL-cached alias index over `<config_root>/*/meta.json`. Reads take the
/// read lock only; a refresh re-scans the store under the write lock and no
/// I/O happens while a lock is held by lookups.
pub struct Resolver {
    config_root: PathBuf,
    domain_tail: String,
    cache_ttl: Duration,
    cache: RwLock<Cache>,
}

impl Resolver {
    pub fn new(
        config_root: impl Into<PathBuf>,
        domain_prefix: &str,
        domain_suffix: &str,
        cache_ttl: Duration,
    ) -> Resolver {
        let prefix = normalize_domain_part(domain_prefix);
        let mut suffix = normalize_domain_part(domain_suffix);
        if suffix.is_empty() {
            suffix = "localhost".to_string();
        }
        let domain_tail = if prefix.is_empty() {
            format!(".{suffix}")
        } else {
            format!(".{prefix}.{suffix}")
        };
        let cache_ttl = if cache_ttl.is_zero() {
            Duration::from_secs(5)
        } else {
            cache_ttl
        };

        Resolver {
            config_root: config_root.into(),
            domain_tail,
            cache_ttl,
            cache: RwLock::new(Cache {
                valid_until: None,
                by_alias: HashMap::new(),
                ordered: Vec::new(),
            }),
        }
    }

    pub fn resolve(&self, server_name: &str) -> Result<VmMetadata, ResolveError> {
        let label = self.label_from_server_name(server_name)?;
        self.refresh_cache_if_needed()?;

        let cache = self.cache.read().unwrap();
        cache
            .by_alias
            .get(&label)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(server_name.to_string()))
    }

    /// Head of the ordered list: the oldest VM on the host.
    pub fn resolve_first(&self) -> Result<VmMetadata, ResolveError> {
        self.refresh_cache_if_needed()?;

        let cache = self.cache.read().unwrap();
        cache
            .ordered
            .first()
            .cloned()
            .ok_or_else(|| ResolveError::NotFound("no vm metadata found".to_string()))
    }

    fn label_from_server_name(&self, server_name: &str) -> Result<String, ResolveError> {
        let name = server_name.trim().to_lowercase();
        let name = name.strip_suffix('.').unwrap_or(&name);
        if name.is_empty() {
            return Err(ResolveError::EmptyServerName);
        }
        let label = name
            .strip_suffix(&self.domain_tail)
            .ok_or_else(|| ResolveError::WrongDomain(self.domain_tail.clone()))?;
        if label.is_empty() || label.contains('.') {
            return Err(ResolveError::InvalidLabel(server_name.to_string()));
        }
        Ok(label.to_string())
    }

    fn refresh_cache_if_needed(&self) -> Result<(), ResolveError> {
        {
            let cache = self.cache.read().unwrap();
            if cache_is_valid(&cache) {
                return Ok(());
            }
        }

        let mut cache = self.cache.write().unwrap();
        if cache_is_valid(&cache) {
            return Ok(());
        }

        let mut metas = self.read_all_metas()?;
        sort_descriptors(&mut metas);

        let mut by_alias: HashMap<String, VmMetadata> = HashMap::new();
        for meta in &metas {
            for alias in aliases_for_meta(meta) {
                if by_alias.contains_key(&alias) {
                    warn!(alias = %alias, vm_id = %meta.id, "duplicate alias while building resolver cache");
                    continue;
                }
                by_alias.insert(alias, meta.clone());
            }
        }

        debug!(
            entries = by_alias.len(),
            ordered_vms = metas.len(),
            ttl = ?self.cache_ttl,
            "resolver cache refreshed"
        );
        cache.by_alias = by_alias;
        cache.ordered = metas;
        cache.valid_until = Some(Instant::now() + self.cache_ttl);
        Ok(())
    }

    fn read_all_metas(&self) -> Result<Vec<VmMetadata>, ResolveError> {
        let mut metas = Vec::new();
        for entry in std::fs::read_dir(&self.config_root)? {
            let Ok(entry) = entry else { continue };
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }

            let meta_path = entry.path().join("meta.json");
            let content = match std::fs::read(&meta_path) {
                Ok(content) => content,
                Err(_) => continue,
            };
            match serde_json::from_slice::<VmMetadata>(&content) {
                Ok(meta) => metas.push(meta),
                Err(err) => {
                    warn!(path = %meta_path.display(), error = %err, "failed to parse vm metadata");
                }
            }
        }
        Ok(metas)
    }
}

fn cache_is_valid(cache: &Cache) -> bool {
    !cache.by_alias.is_empty()
        && cache
            .valid_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
}

/// createdAt ascending with epoch (unset) timestamps last; ID breaks ties.
fn sort_descriptors(metas: &mut [VmMetadata]) {
    metas.sort_by(|a, b| {
        match (is_zero(a.created_at), is_zero(b.created_at)) {
            (true, true) => a.id.cmp(&b.id),
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => a
                .created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id)),
        }
    });
}

fn is_zero(timestamp: DateTime<Utc>) -> bool {
    timestamp == DateTime::<Utc>::UNIX_EPOCH
}

fn aliases_for_meta(meta: &VmMetadata) -> Vec<String> {
    let mut seen = Vec::new();
    let mut add = |value: &str| {
        let value = value.trim().to_lowercase();
        if value.is_empty() || seen.contains(&value) {
            return;
        }
        seen.push(value);
    };

    add(&meta.id);
    if meta.id.len() >= 8 {
        add(&meta.id[..8]);
    }

    for key in ["host", "hostname", "app", "name"] {
        if let Some(tags) = &meta.tags {
            if let Some(value) = tags.get(key) {
                add(value);
            }
        }
        if let Some(metadata) = &meta.metadata {
            if let Some(serde_json::Value::String(value)) = metadata.get(key) {
                add(value);
            }
        }
    }

    seen
}

fn normalize_domain_part(raw: &str) -> String {
    raw.trim().to_lowercase().trim_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn write_meta(root: &Path, id: &str, body: &str) {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("meta.json"), body).unwrap();
    }

    #[test]
    fn resolves_by_tag_and_short_uuid() {
        let root = tempfile::tempdir().unwrap();
        let vm_id = "084604f6-0766-4b7d-9d23-0b7a011d6eaa";
        write_meta(
            root.path(),
            vm_id,
            r#"{
              "id": "084604f6-0766-4b7d-9d23-0b7a011d6eaa",
              "guestIP": "172.30.0.5",
              "netns": "mergen-084604f6",
              "tapName": "tap-084604f6",
              "ports": [{"guest": 8080, "host": 20002, "protocol": "tcp"}],
              "tags": {"app": "app1", "host": "app1"}
            }"#,
        );

        let resolver = Resolver::new(root.path(), "", "localhost", Duration::from_secs(1));

        let by_app = resolver.resolve("app1.localhost").unwrap();
        assert_eq!(by_app.id, vm_id);

        let by_short = resolver.resolve("084604f6.localhost").unwrap();
        assert_eq!(by_short.id, vm_id);

        let with_dot = resolver.resolve("App1.Localhost.").unwrap();
        assert_eq!(with_dot.id, vm_id);
    }

    #[test]
    fn resolves_with_domain_prefix_and_suffix() {
        let root = tempfile::tempdir().unwrap();
        let vm_id = "11111111-2222-3333-4444-555555555555";
        write_meta(
            root.path(),
            vm_id,
            r#"{
              "id": "11111111-2222-3333-4444-555555555555",
              "guestIP": "10.0.0.3",
              "netns": "mergen-11111111",
              "tags": {"app": "edgeapp"}
            }"#,
        );

        let resolver = Resolver::new(root.path(), "vm", "example.com", Duration::from_secs(1));
        let by_app = resolver.resolve("edgeapp.vm.example.com").unwrap();
        assert_eq!(by_app.id, vm_id);

        match resolver.resolve("edgeapp.other.example.com") {
            Err(ResolveError::WrongDomain(tail)) => assert_eq!(tail, ".vm.example.com"),
            other => panic!("expected WrongDomain, got {other:?}"),
        }
    }

    #[test]
    fn hostname_shape_is_validated() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path()).unwrap();
        let resolver = Resolver::new(root.path(), "", "localhost", Duration::from_secs(1));

        match resolver.resolve("") {
            Err(ResolveError::EmptyServerName) => {}
            other => panic!("expected EmptyServerName, got {other:?}"),
        }
        match resolver.resolve("a.b.localhost") {
            Err(ResolveError::InvalidLabel(_)) => {}
            other => panic!("expected InvalidLabel, got {other:?}"),
        }
        match resolver.resolve(".localhost") {
            Err(ResolveError::InvalidLabel(_)) => {}
            other => panic!("expected InvalidLabel, got {other:?}"),
        }
        match resolver.resolve("app.elsewhere") {
            Err(ResolveError::WrongDomain(_)) => {}
            other => panic!("expected WrongDomain, got {other:?}"),
        }
    }

    #[test]
    fn resolve_first_returns_the_oldest_vm() {
        let root = tempfile::tempdir().unwrap();
        write_meta(
            root.path(),
            "0aaaaaaa-0000-0000-0000-000000000000",
            r#"{
              "id": "0aaaaaaa-0000-0000-0000-000000000000",
              "createdAt": "2026-02-09T00:00:00Z",
              "guestIP": "172.30.0.2"
            }"#,
        );
        write_meta(
            root.path(),
            "faaaaaaa-0000-0000-0000-000000000000",
            r#"{
              "id": "faaaaaaa-0000-0000-0000-000000000000",
              "createdAt": "2026-02-10T00:00:00Z",
              "guestIP": "172.30.0.3"
            }"#,
        );

        let resolver = Resolver::new(root.path(), "", "localhost", Duration::from_secs(1));
        let first = resolver.resolve_first().unwrap();
        assert_eq!(first.id, "0aaaaaaa-0000-0000-0000-000000000000");

        let by_short = resolver.resolve("0aaaaaaa.localhost").unwrap();
        assert_eq!(by_short.id, first.id);
    }

    #[test]
    fn zero_timestamps_sort_last_and_first_alias_claim_wins() {
        let mut metas = vec![
            VmMetadata {
                id: "b-no-timestamp".into(),
                ..VmMetadata::default()
            },
            VmMetadata {
                id: "a-real".into(),
                created_at: "2026-02-10T00:00:00Z".parse().unwrap(),
                ..VmMetadata::default()
            },
        ];
        sort_descriptors(&mut metas);
        assert_eq!(metas[0].id, "a-real");
        assert_eq!(metas[1].id, "b-no-timestamp");

        let root = tempfile::tempdir().unwrap();
        write_meta(
            root.path(),
            "10000000-0000-0000-0000-000000000000",
            r#"{
              "id": "10000000-0000-0000-0000-000000000000",
              "createdAt": "2026-02-09T00:00:00Z",
              "tags": {"app": "shared"}
            }"#,
        );
        write_meta(
            root.path(),
            "20000000-0000-0000-0000-000000000000",
            r#"{
              "id": "20000000-0000-0000-0000-000000000000",
              "createdAt": "2026-02-10T00:00:00Z",
              "tags": {"app": "shared"}
            }"#,
        );

        let resolver = Resolver::new(root.path(), "", "localhost", Duration::from_secs(1));
        let winner = resolver.resolve("shared.localhost").unwrap();
        assert_eq!(winner.id, "10000000-0000-0000-0000-000000000000");
    }

    #[test]
    fn metadata_string_values_become_aliases() {
        let meta: VmMetadata = serde_json::from_str(
            r#"{
              "id": "30000000-0000-0000-0000-000000000000",
              "metadata": {"name": "Billing", "hostname": 42}
            }"#,
        )
        .unwrap();
        let aliases = aliases_for_meta(&meta);
        assert!(aliases.contains(&"billing".to_string()));
        assert!(aliases.contains(&"30000000".to_string()));
        assert!(!aliases.iter().any(|a| a == "42"));
    }
}
