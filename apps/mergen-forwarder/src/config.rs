use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// One inbound listener: the bind address and the static guest port its
/// connections are forwarded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub addr: String,
    pub guest_port: u16,
}

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub config_root: PathBuf,
    pub netns_root: String,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub listeners: Vec<Listener>,
    pub domain_prefix: String,
    pub domain_suffix: String,
    pub log_level: String,
    pub dial_timeout: Duration,
    pub resolver_cache_ttl: Duration,
    pub shutdown_timeout: Duration,
}

impl ForwarderConfig {
    pub fn from_env() -> Result<ForwarderConfig> {
        let domain_prefix = normalize_domain_part(&env_or("FWD_DOMAIN_PREFIX", ""));
        let domain_suffix = normalize_domain_part(&env_or("FWD_DOMAIN_SUFFIX", "localhost"));
        if domain_suffix.is_empty() {
            bail!("FWD_DOMAIN_SUFFIX cannot be empty");
        }

        let listeners = parse_listeners(&env_or("FWD_LISTENERS", ":443=80,:2022=22"))
            .context("invalid FWD_LISTENERS")?;

        let cert_base = domain_base(&domain_prefix, &domain_suffix);

        Ok(ForwarderConfig {
            config_root: env_or("FWD_CONFIG_ROOT", "/etc/mergen/vm.d").into(),
            netns_root: env_or("FWD_NETNS_ROOT", "/run/netns"),
            cert_file: env_or(
                "FWD_TLS_CERT_FILE",
                &format!("/etc/mergen/certs/wildcard.{cert_base}.crt"),
            )
            .into(),
            key_file: env_or(
                "FWD_TLS_KEY_FILE",
                &format!("/etc/mergen/certs/wildcard.{cert_base}.key"),
            )
            .into(),
            listeners,
            domain_prefix,
            domain_suffix,
            log_level: env_or("FWD_LOG_LEVEL", "debug"),
            dial_timeout: Duration::from_secs(env_u64("FWD_DIAL_TIMEOUT_SECONDS", 5)),
            resolver_cache_ttl: Duration::from_secs(env_u64("FWD_RESOLVER_CACHE_TTL_SECONDS", 5)),
            shutdown_timeout: Duration::from_secs(env_u64("FWD_SHUTDOWN_TIMEOUT_SECONDS", 15)),
        })
    }
}

/// Comma-separated `addr=guest_port` entries, e.g. `:443=80,:2022=22`.
pub fn parse_listeners(raw: &str) -> Result<Vec<Listener>> {
    let mut listeners = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (addr_part, port_part) = entry
            .split_once('=')
            .with_context(|| format!("listener entry {entry:?} must look like addr=guest_port"))?;
        let addr = normalize_listen_addr(addr_part)?;
        let guest_port: u16 = port_part
            .trim()
            .parse()
            .ok()
            .filter(|port| *port > 0)
            .with_context(|| format!("invalid guest port in listener entry {entry:?}"))?;
        listeners.push(Listener { addr, guest_port });
    }
    if listeners.is_empty() {
        bail!("no listeners configured");
    }
    Ok(listeners)
}

pub fn normalize_listen_addr(raw: &str) -> Result<String> {
    let mut addr = raw.trim().to_string();
    if addr.is_empty() {
        bail!("listen address cannot be empty");
    }
    if !addr.contains(':') {
        addr = format!(":{addr}");
    }
    let (_, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("invalid listen address {raw:?}"))?;
    let parsed: u32 = port
        .parse()
        .with_context(|| format!("invalid listen port in {raw:?}"))?;
    if parsed == 0 || parsed > 65535 {
        bail!("invalid listen port in {raw:?}");
    }
    Ok(addr)
}

/// `:443`-style addresses need an explicit host before they can be bound.
pub fn bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

pub fn listener_port(listener: &Listener) -> Option<u16> {
    listener.addr.rsplit_once(':')?.1.parse().ok()
}

fn domain_base(prefix: &str, suffix: &str) -> String {
    if prefix.is_empty() {
        suffix.to_string()
    } else {
        format!("{prefix}.{suffix}")
    }
}

fn normalize_domain_part(raw: &str) -> String {
    raw.trim().to_lowercase().trim_matches('.').to_string()
}

fn env_or(key: &str, fallback: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn env_u64(key: &str, fallback: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addr_normalization() {
        assert_eq!(normalize_listen_addr(":443").unwrap(), ":443");
        assert_eq!(normalize_listen_addr("8443").unwrap(), ":8443");
        assert_eq!(
            normalize_listen_addr("127.0.0.1:443").unwrap(),
            "127.0.0.1:443"
        );
        assert!(normalize_listen_addr("abc").is_err());
        assert!(normalize_listen_addr(":0").is_err());
        assert!(normalize_listen_addr("").is_err());
    }

    #[test]
    fn listener_entries_parse_addr_and_guest_port() {
        let listeners = parse_listeners(":443=80, :2022=22").unwrap();
        assert_eq!(
            listeners,
            vec![
                Listener {
                    addr: ":443".into(),
                    guest_port: 80
                },
                Listener {
                    addr: ":2022".into(),
                    guest_port: 22
                },
            ]
        );
        assert_eq!(listener_port(&listeners[0]), Some(443));
    }

    #[test]
    fn malformed_listener_entries_are_rejected() {
        assert!(parse_listeners("443").is_err());
        assert!(parse_listeners(":443=http").is_err());
        assert!(parse_listeners(":443=0").is_err());
        assert!(parse_listeners("").is_err());
    }

    #[test]
    fn domain_parts_are_lowercased_and_trimmed() {
        assert_eq!(normalize_domain_part(" .VM.Example.COM. "), "vm.example.com");
        assert_eq!(domain_base("", "localhost"), "localhost");
        assert_eq!(domain_base("vm", "example.com"), "vm.example.com");
    }

    #[test]
    fn bind_addr_fills_wildcard_host() {
        assert_eq!(bind_addr(":443"), "0.0.0.0:443");
        assert_eq!(bind_addr("127.0.0.1:443"), "127.0.0.1:443");
    }
}
