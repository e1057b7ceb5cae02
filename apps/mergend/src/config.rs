use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_addr: String,
    pub config_root: PathBuf,
    pub data_root: PathBuf,
    pub run_root: PathBuf,
    pub global_hooks_dir: PathBuf,
    pub unit_prefix: String,
    pub systemctl_path: String,
    pub command_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub port_start: u16,
    pub port_end: u16,
    pub guest_cidr: String,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Config {
        Config {
            http_addr: env_or("MGR_HTTP_ADDR", ":8080"),
            config_root: env_or("MGR_CONFIG_ROOT", "/etc/mergen/vm.d").into(),
            data_root: env_or("MGR_DATA_ROOT", "/var/lib/mergen").into(),
            run_root: env_or("MGR_RUN_ROOT", "/run/mergen").into(),
            global_hooks_dir: env_or("MGR_GLOBAL_HOOKS_DIR", "/etc/mergen/hooks.d").into(),
            unit_prefix: env_or("MGR_UNIT_PREFIX", "mergen"),
            systemctl_path: env_or("MGR_SYSTEMCTL_PATH", "systemctl"),
            command_timeout: Duration::from_secs(env_u64("MGR_COMMAND_TIMEOUT_SECONDS", 10)),
            shutdown_timeout: Duration::from_secs(env_u64("MGR_SHUTDOWN_TIMEOUT_SECONDS", 15)),
            port_start: env_u16("MGR_PORT_START", 20000),
            port_end: env_u16("MGR_PORT_END", 40000),
            guest_cidr: env_or("MGR_GUEST_CIDR", "172.30.0.0/24"),
            log_level: env_or("MGR_LOG_LEVEL", "info"),
        }
    }

    /// `:8080`-style addresses are accepted from the environment; tokio's
    /// listener wants an explicit host.
    pub fn bind_addr(&self) -> String {
        if self.http_addr.starts_with(':') {
            format!("0.0.0.0{}", self.http_addr)
        } else {
            self.http_addr.clone()
        }
    }
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

fn env_u16(key: &str, fallback: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(fallback)
}
