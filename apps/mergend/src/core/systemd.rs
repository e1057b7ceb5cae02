use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SystemdError {
    #[error("systemd unavailable on this host")]
    Unavailable,
    #[error("systemd unit not found: {0}")]
    UnitNotFound(String),
    #[error("systemctl {args} exited with status {status}: {detail}")]
    Exit {
        args: String,
        status: i32,
        detail: String,
    },
    #[error("systemctl {args} failed: {message}")]
    Command { args: String, message: String },
}

#[derive(Debug, Clone, Default)]
pub struct Status {
    pub available: bool,
    pub unit: String,
    pub active: bool,
    pub active_state: String,
    pub sub_state: String,
    pub main_pid: i32,
}

/// Capabilities the lifecycle service consumes from the process supervisor.
/// One long-running unit per VM; start/stop are expected to be idempotent.
#[async_trait]
pub trait SystemdClient: Send + Sync {
    async fn start(&self, id: &str) -> Result<(), SystemdError>;
    async fn stop(&self, id: &str) -> Result<(), SystemdError>;
    async fn disable(&self, id: &str) -> Result<(), SystemdError>;
    async fn is_active(&self, id: &str) -> Result<bool, SystemdError>;
    async fn status(&self, id: &str) -> Result<Status, SystemdError>;
}

pub struct ExecClient {
    systemctl: String,
    unit_prefix: String,
    timeout: Duration,
    available: bool,
}

impl ExecClient {
    pub fn new(systemctl_path: &str, unit_prefix: &str, timeout: Duration) -> ExecClient {
        match lookup_path(systemctl_path) {
            Some(resolved) => {
                debug!(systemctl = %resolved, unit_prefix = %unit_prefix, ?timeout, "systemd client initialized");
                ExecClient {
                    systemctl: resolved,
                    unit_prefix: unit_prefix.to_string(),
                    timeout,
                    available: true,
                }
            }
            None => {
                warn!(path = %systemctl_path, "systemctl not found in PATH");
                ExecClient {
                    systemctl: systemctl_path.to_string(),
                    unit_prefix: unit_prefix.to_string(),
                    timeout,
                    available: false,
                }
            }
        }
    }

    fn unit_name(&self, id: &str) -> String {
        format!("{}@{}.service", self.unit_prefix, id)
    }

    async fn run(&self, args: &[&str]) -> Result<String, SystemdError> {
        if !self.available {
            debug!(args = %args.join(" "), "systemd run skipped because client unavailable");
            return Err(SystemdError::Unavailable);
        }

        let joined = args.join(" ");
        debug!(command = %self.systemctl, args = %joined, "executing systemctl command");

        let output = match tokio::time::timeout(
            self.timeout,
            Command::new(&self.systemctl).args(args).output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(SystemdError::Command {
                    args: joined,
                    message: err.to_string(),
                })
            }
            Err(_) => {
                return Err(SystemdError::Command {
                    args: joined,
                    message: format!("timed out after {:?}", self.timeout),
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            if !stdout.is_empty() {
                debug!(args = %joined, output = %stdout, "systemctl command output");
            }
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let detail = if stderr.is_empty() { stdout } else { stderr };
        Err(classify_failure(
            joined,
            output.status.code().unwrap_or(-1),
            detail,
        ))
    }
}

fn classify_failure(args: String, status: i32, detail: String) -> SystemdError {
    if detail.contains("System has not been booted with systemd")
        || detail.contains("Failed to connect to bus")
    {
        warn!(args = %args, error = %detail, "systemd appears unavailable");
        return SystemdError::Unavailable;
    }
    if detail.contains("Unit ") && detail.contains(" not found") {
        warn!(args = %args, error = %detail, "systemd unit not found");
        return SystemdError::UnitNotFound(detail);
    }
    SystemdError::Exit {
        args,
        status,
        detail,
    }
}

#[async_trait]
impl SystemdClient for ExecClient {
    async fn start(&self, id: &str) -> Result<(), SystemdError> {
        let unit = self.unit_name(id);
        debug!(vm_id = %id, unit = %unit, "systemd start requested");
        if self.is_active(id).await? {
            debug!(vm_id = %id, unit = %unit, "start skipped, unit already active");
            return Ok(());
        }
        self.run(&["start", &unit]).await?;
        debug!(vm_id = %id, unit = %unit, "systemd start succeeded");
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<(), SystemdError> {
        let unit = self.unit_name(id);
        debug!(vm_id = %id, unit = %unit, "systemd stop requested");
        if !self.is_active(id).await? {
            debug!(vm_id = %id, unit = %unit, "stop skipped, unit already inactive");
            return Ok(());
        }
        self.run(&["stop", &unit]).await?;
        debug!(vm_id = %id, unit = %unit, "systemd stop succeeded");
        Ok(())
    }

    async fn disable(&self, id: &str) -> Result<(), SystemdError> {
        let unit = self.unit_name(id);
        self.run(&["disable", &unit]).await?;
        debug!(vm_id = %id, unit = %unit, "systemd disable succeeded");
        Ok(())
    }

    async fn is_active(&self, id: &str) -> Result<bool, SystemdError> {
        let unit = self.unit_name(id);
        match self.run(&["is-active", "--quiet", &unit]).await {
            Ok(_) => Ok(true),
            Err(SystemdError::Exit { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn status(&self, id: &str) -> Result<Status, SystemdError> {
        let mut status = Status {
            available: self.available,
            unit: self.unit_name(id),
            ..Status::default()
        };
        if !self.available {
            return Ok(status);
        }

        let unit = status.unit.clone();
        let output = self
            .run(&[
                "show",
                &unit,
                "--property=MainPID",
                "--property=ActiveState",
                "--property=SubState",
            ])
            .await?;
        parse_show_output(&output, &mut status);
        status.active = status.active_state == "active";
        debug!(
            vm_id = %id,
            unit = %status.unit,
            active_state = %status.active_state,
            sub_state = %status.sub_state,
            main_pid = status.main_pid,
            "systemd status read"
        );
        Ok(status)
    }
}

fn parse_show_output(output: &str, status: &mut Status) {
    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "MainPID" => {
                if let Ok(pid) = value.trim().parse() {
                    status.main_pid = pid;
                }
            }
            "ActiveState" => status.active_state = value.trim().to_string(),
            "SubState" => status.sub_state = value.trim().to_string(),
            _ => {}
        }
    }
}

fn lookup_path(command: &str) -> Option<String> {
    if command.contains('/') {
        return Path::new(command)
            .is_file()
            .then(|| command.to_string());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(command))
        .find(|candidate| candidate.is_file())
        .map(|candidate| candidate.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn show_output_is_parsed_into_status() {
        let mut status = Status::default();
        parse_show_output(
            "MainPID=4242\nActiveState=active\nSubState=running\nGarbageLine\n",
            &mut status,
        );
        assert_eq!(status.main_pid, 4242);
        assert_eq!(status.active_state, "active");
        assert_eq!(status.sub_state, "running");
    }

    #[test]
    fn failure_classification_matches_systemctl_markers() {
        match classify_failure(
            "start mergen@x.service".into(),
            1,
            "System has not been booted with systemd (PID 1)".into(),
        ) {
            SystemdError::Unavailable => {}
            other => panic!("expected Unavailable, got {other:?}"),
        }

        match classify_failure(
            "start mergen@x.service".into(),
            5,
            "Unit mergen@x.service not found.".into(),
        ) {
            SystemdError::UnitNotFound(_) => {}
            other => panic!("expected UnitNotFound, got {other:?}"),
        }

        match classify_failure("is-active --quiet mergen@x.service".into(), 3, String::new()) {
            SystemdError::Exit { status, .. } => assert_eq!(status, 3),
            other => panic!("expected Exit, got {other:?}"),
        }
    }

    #[test]
    fn unit_name_uses_template_prefix() {
        let client = ExecClient::new("/definitely/not/here", "mergen", Duration::from_secs(1));
        assert!(!client.available);
        assert_eq!(client.unit_name("abc"), "mergen@abc.service");
    }
}
