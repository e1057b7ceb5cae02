use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

/// Dials a backend address inside a named network namespace.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: SocketAddr, netns: &str) -> io::Result<TcpStream>;
}

/// Linux implementation: the whole namespace switch happens on one blocking
/// OS thread, and the origin namespace is always restored before the thread
/// goes back to the pool.
pub struct NetnsDialer {
    timeout: Duration,
    roots: Vec<PathBuf>,
}

impl NetnsDialer {
    pub fn new(timeout: Duration, netns_root: &str) -> NetnsDialer {
        let configured = netns_root.trim();
        let configured = if configured.is_empty() {
            "/run/netns"
        } else {
            configured
        };

        let mut roots = vec![PathBuf::from(configured)];
        for fallback in ["/run/netns", "/var/run/netns"] {
            if configured != fallback {
                roots.push(PathBuf::from(fallback));
            }
        }

        NetnsDialer { timeout, roots }
    }
}

#[async_trait]
impl Dialer for NetnsDialer {
    async fn dial(&self, addr: SocketAddr, netns: &str) -> io::Result<TcpStream> {
        if netns.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "netns is empty",
            ));
        }

        #[cfg(target_os = "linux")]
        {
            let roots = self.roots.clone();
            let netns = netns.to_string();
            let timeout = self.timeout;
            let stream = tokio::task::spawn_blocking(move || {
                linux::connect_in_netns(&roots, &netns, addr, timeout)
            })
            .await
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))??;

            stream.set_nonblocking(true)?;
            TcpStream::from_std(stream)
        }

        #[cfg(not(target_os = "linux"))]
        {
            let _ = addr;
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "network namespace dialing requires linux",
            ))
        }
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::fs::File;
    use std::io;
    use std::net::SocketAddr;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use nix::sched::{setns, CloneFlags};
    use tracing::error;

    pub fn connect_in_netns(
        roots: &[PathBuf],
        netns: &str,
        addr: SocketAddr,
        timeout: Duration,
    ) -> io::Result<std::net::TcpStream> {
        let origin = File::open("/proc/self/ns/net")?;
        let (target_path, target) = open_target_ns(roots, netns)?;

        setns(&target, CloneFlags::CLONE_NEWNET).map_err(|errno| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("setns target {} failed: {errno}", target_path.display()),
            )
        })?;

        let result = std::net::TcpStream::connect_timeout(&addr, timeout);

        // Whatever the connect did, this thread must leave in its origin
        // namespace.
        if let Err(errno) = setns(&origin, CloneFlags::CLONE_NEWNET) {
            error!(error = %errno, "failed to restore origin network namespace");
        }

        result
    }

    fn open_target_ns(roots: &[PathBuf], netns: &str) -> io::Result<(PathBuf, File)> {
        let mut last_err: Option<io::Error> = None;
        for root in roots {
            let candidate: &Path = &root.join(netns);
            match File::open(candidate) {
                Ok(file) => return Ok((candidate.to_path_buf(), file)),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "netns path resolution failed")
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_root_is_tried_before_fallbacks() {
        let dialer = NetnsDialer::new(Duration::from_secs(5), "/custom/netns");
        assert_eq!(
            dialer.roots,
            vec![
                PathBuf::from("/custom/netns"),
                PathBuf::from("/run/netns"),
                PathBuf::from("/var/run/netns"),
            ]
        );

        let default = NetnsDialer::new(Duration::from_secs(5), "  ");
        assert_eq!(
            default.roots,
            vec![PathBuf::from("/run/netns"), PathBuf::from("/var/run/netns")]
        );
    }

    #[tokio::test]
    async fn empty_netns_is_rejected() {
        let dialer = NetnsDialer::new(Duration::from_secs(1), "/run/netns");
        let err = dialer
            .dial("127.0.0.1:80".parse().unwrap(), "")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
