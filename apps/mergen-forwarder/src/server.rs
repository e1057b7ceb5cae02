use std::io::BufReader;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mergen_types::VmMetadata;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::{bind_addr, listener_port, ForwarderConfig, Listener};
use crate::netns::Dialer;
use crate::resolver::Resolver;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(150);

pub struct Server {
    config: ForwarderConfig,
    resolver: Arc<Resolver>,
    dialer: Arc<dyn Dialer>,
    tls: Option<TlsAcceptor>,
    active: AtomicUsize,
    drained: Notify,
    force_close_tx: watch::Sender<bool>,
    force_close_rx: watch::Receiver<bool>,
}

impl Server {
    pub fn new(
        config: ForwarderConfig,
        resolver: Arc<Resolver>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Server> {
        let tls = if requires_tls_certificate(&config.listeners) {
            Some(load_tls_acceptor(&config)?)
        } else {
            debug!("all listeners are plain, skipping certificate load");
            None
        };

        let (force_close_tx, force_close_rx) = watch::channel(false);
        Ok(Server {
            config,
            resolver,
            dialer,
            tls,
            active: AtomicUsize::new(0),
            drained: Notify::new(),
            force_close_tx,
            force_close_rx,
        })
    }

    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut accept_tasks = Vec::new();
        for listener_cfg in self.config.listeners.clone() {
            let addr = bind_addr(&listener_cfg.addr);
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("listen {addr} failed"))?;
            info!(
                addr = %listener_cfg.addr,
                guest_port = listener_cfg.guest_port,
                plain = is_plain_first_vm_listener(&listener_cfg),
                "forwarder listener started"
            );
            accept_tasks.push(tokio::spawn(
                self.clone()
                    .accept_loop(listener_cfg, listener, shutdown.clone()),
            ));
        }

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        info!("forwarder listeners closing");

        for task in accept_tasks {
            if let Ok(Err(err)) = task.await {
                warn!(error = %err, "listener loop ended with error");
            }
        }

        self.wait_for_connections().await;
        Ok(())
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener_cfg: Listener,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            self.track();
                            let server = self.clone();
                            let listener_cfg = listener_cfg.clone();
                            tokio::spawn(async move {
                                server.handle_conn(listener_cfg, stream, peer).await;
                                server.untrack();
                            });
                        }
                        Err(err) if is_transient_accept_error(&err) => {
                            warn!(addr = %listener_cfg.addr, error = %err, "temporary accept error");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                        Err(err) => {
                            error!(addr = %listener_cfg.addr, error = %err, "accept failed");
                            return Err(err).with_context(|| {
                                format!("accept failed on {}", listener_cfg.addr)
                            });
                        }
                    }
                }
            }
        }
    }

    async fn handle_conn(&self, listener_cfg: Listener, stream: TcpStream, peer: SocketAddr) {
        if is_plain_first_vm_listener(&listener_cfg) {
            self.handle_plain_conn(&listener_cfg, stream, peer).await;
            return;
        }

        let Some(acceptor) = self.tls.clone() else {
            error!(addr = %listener_cfg.addr, "tls listener without an acceptor");
            return;
        };

        let mut tls_stream = match acceptor.accept(stream).await {
            Ok(tls_stream) => tls_stream,
            Err(err) => {
                warn!(remote_addr = %peer, error = %err, "tls handshake failed");
                return;
            }
        };

        let server_name = tls_stream
            .get_ref()
            .1
            .server_name()
            .map(|name| name.trim().to_lowercase())
            .unwrap_or_default();
        if server_name.is_empty() {
            warn!(remote_addr = %peer, "tls client has no sni");
            let _ = write_http_error(&mut tls_stream, 421, "missing sni").await;
            return;
        }

        let meta = match self.resolver.resolve(&server_name) {
            Ok(meta) => meta,
            Err(err) => {
                warn!(server_name = %server_name, error = %err, "sni resolve failed");
                let _ = write_http_error(&mut tls_stream, 404, "vm not found").await;
                return;
            }
        };

        let Some(target_port) = backend_port(&listener_cfg, &meta) else {
            warn!(
                server_name = %server_name,
                vm_id = %meta.id,
                "vm backend port unavailable"
            );
            let _ = write_http_error(&mut tls_stream, 502, "vm backend port not configured").await;
            return;
        };

        let backend = match self.dial_backend(&meta, target_port).await {
            Ok(backend) => backend,
            Err(err) => {
                warn!(
                    server_name = %server_name,
                    vm_id = %meta.id,
                    netns = %meta.netns,
                    target_port,
                    error = %err,
                    "backend dial failed"
                );
                let _ = write_http_error(&mut tls_stream, 502, "backend unavailable").await;
                return;
            }
        };

        debug!(
            server_name = %server_name,
            vm_id = %meta.id,
            netns = %meta.netns,
            target_port,
            remote_addr = %peer,
            "connection routed"
        );
        self.splice(tls_stream, backend).await;
    }

    async fn handle_plain_conn(&self, listener_cfg: &Listener, stream: TcpStream, peer: SocketAddr) {
        let meta = match self.resolver.resolve_first() {
            Ok(meta) => meta,
            Err(err) => {
                debug!(remote_addr = %peer, error = %err, "plain route has no vm");
                return;
            }
        };

        let backend = match self.dial_backend(&meta, listener_cfg.guest_port).await {
            Ok(backend) => backend,
            Err(err) => {
                warn!(
                    vm_id = %meta.id,
                    netns = %meta.netns,
                    guest_port = listener_cfg.guest_port,
                    error = %err,
                    "plain backend dial failed"
                );
                return;
            }
        };

        debug!(vm_id = %meta.id, remote_addr = %peer, "plain connection routed");
        self.splice(stream, backend).await;
    }

    async fn dial_backend(&self, meta: &VmMetadata, port: u16) -> std::io::Result<TcpStream> {
        let ip: IpAddr = meta.guest_ip.parse().map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid guest ip {:?}", meta.guest_ip),
            )
        })?;
        self.dialer.dial(SocketAddr::new(ip, port), &meta.netns).await
    }

    /// Splices until both directions drain, or until shutdown force-closes
    /// the tracked connections.
    async fn splice<A, B>(&self, client: A, backend: B)
    where
        A: AsyncRead + AsyncWrite + Unpin,
        B: AsyncRead + AsyncWrite + Unpin,
    {
        let mut force_close = self.force_close_rx.clone();
        tokio::select! {
            _ = proxy_streams(client, backend) => {}
            _ = async {
                loop {
                    if *force_close.borrow() {
                        break;
                    }
                    if force_close.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            } => {
                debug!("connection force-closed during shutdown");
            }
        }
    }

    fn track(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    fn untrack(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.drained.notify_waiters();
    }

    fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    async fn wait_for_connections(&self) {
        let timeout = if self.config.shutdown_timeout.is_zero() {
            Duration::from_secs(15)
        } else {
            self.config.shutdown_timeout
        };

        if tokio::time::timeout(timeout, self.drain()).await.is_ok() {
            info!("forwarder graceful shutdown completed");
            return;
        }

        warn!(
            active_connections = self.active_connections(),
            ?timeout,
            "forwarder shutdown timeout reached, forcing connection close"
        );
        let _ = self.force_close_tx.send(true);
        self.drain().await;
    }

    async fn drain(&self) {
        loop {
            let notified = self.drained.notified();
            if self.active_connections() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Plain first-VM passthrough: guest SSH exposed on host port 2022 without
/// TLS in front of it.
pub fn is_plain_first_vm_listener(listener: &Listener) -> bool {
    listener.guest_port == 22 && listener_port(listener) == Some(2022)
}

pub fn requires_tls_certificate(listeners: &[Listener]) -> bool {
    listeners
        .iter()
        .any(|listener| !is_plain_first_vm_listener(listener))
}

/// The HTTPS listener prefers the descriptor's httpPort and falls back to
/// its static guest port; other TLS listeners always use the static port.
pub fn backend_port(listener: &Listener, meta: &VmMetadata) -> Option<u16> {
    let port = if listener_port(listener) == Some(443) {
        meta.http_port.filter(|port| *port > 0).unwrap_or(listener.guest_port)
    } else {
        listener.guest_port
    };
    (port > 0).then_some(port)
}

fn load_tls_acceptor(config: &ForwarderConfig) -> Result<TlsAcceptor> {
    let cert_file = std::fs::File::open(&config.cert_file)
        .with_context(|| format!("open tls certificate {}", config.cert_file.display()))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::io::Result<_>>()
        .context("parse tls certificate chain")?;

    let key_file = std::fs::File::open(&config.key_file)
        .with_context(|| format!("open tls key {}", config.key_file.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .context("parse tls key")?
        .context("no private key found")?;

    let tls_config = ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS12,
        &rustls::version::TLS13,
    ])
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .context("build tls server config")?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// Bidirectional copy with independent half-close propagation: when one
/// direction hits EOF the peer's write side is shut down, then the other
/// direction is allowed to drain.
async fn proxy_streams<A, B>(client: A, backend: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let upstream = async {
        let _ = tokio::io::copy(&mut client_read, &mut backend_write).await;
        let _ = backend_write.shutdown().await;
    };
    let downstream = async {
        let _ = tokio::io::copy(&mut backend_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
    };

    tokio::join!(upstream, downstream);
}

async fn write_http_error<S>(stream: &mut S, code: u16, message: &str) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let body = format!("{message}\n");
    let response = format!(
        "HTTP/1.1 {code} {status}\r\nContent-Type: text/plain\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n{body}",
        status = http_status_text(code),
        len = body.len(),
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

fn http_status_text(code: u16) -> &'static str {
    match code {
        404 => "Not Found",
        421 => "Misdirected Request",
        502 => "Bad Gateway",
        _ => "Error",
    }
}

fn is_transient_accept_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn listener(addr: &str, guest_port: u16) -> Listener {
        Listener {
            addr: addr.to_string(),
            guest_port,
        }
    }

    #[test]
    fn plain_first_vm_listener_detection() {
        assert!(is_plain_first_vm_listener(&listener(":2022", 22)));
        assert!(!is_plain_first_vm_listener(&listener(":443", 443)));
        assert!(!is_plain_first_vm_listener(&listener(":2222", 22)));
        assert!(!is_plain_first_vm_listener(&listener(":2022", 80)));
    }

    #[test]
    fn certificate_requirement_over_listener_sets() {
        assert!(!requires_tls_certificate(&[listener(":2022", 22)]));
        assert!(requires_tls_certificate(&[
            listener(":2022", 22),
            listener(":443", 443),
        ]));
    }

    #[test]
    fn https_listener_prefers_descriptor_http_port() {
        let https = listener(":443", 80);
        let other = listener(":8443", 9000);

        let mut meta = VmMetadata::default();
        meta.http_port = Some(8080);
        assert_eq!(backend_port(&https, &meta), Some(8080));
        assert_eq!(backend_port(&other, &meta), Some(9000));

        meta.http_port = None;
        assert_eq!(backend_port(&https, &meta), Some(80));

        let dead_fallback = listener(":443", 0);
        assert_eq!(backend_port(&dead_fallback, &meta), None);
    }

    #[tokio::test]
    async fn http_error_response_is_well_formed() {
        let mut buffer = Vec::new();
        write_http_error(&mut buffer, 421, "missing sni")
            .await
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.starts_with("HTTP/1.1 421 Misdirected Request\r\n"));
        assert!(text.contains("Content-Length: 12\r\n"));
        assert!(text.ends_with("\r\n\r\nmissing sni\n"));
    }

    #[tokio::test]
    async fn proxy_streams_copies_both_ways_and_propagates_half_close() {
        let (client_near, client_far) = tokio::io::duplex(1024);
        let (backend_near, backend_far) = tokio::io::duplex(1024);

        let proxy = tokio::spawn(proxy_streams(client_far, backend_near));

        let (mut client_read, mut client_write) = tokio::io::split(client_near);
        let (mut backend_read, mut backend_write) = tokio::io::split(backend_far);

        client_write.write_all(b"ping").await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut upstream = Vec::new();
        backend_read.read_to_end(&mut upstream).await.unwrap();
        assert_eq!(upstream, b"ping");

        backend_write.write_all(b"pong").await.unwrap();
        backend_write.shutdown().await.unwrap();

        let mut downstream = Vec::new();
        client_read.read_to_end(&mut downstream).await.unwrap();
        assert_eq!(downstream, b"pong");

        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn transient_accept_errors_are_classified() {
        for kind in [
            std::io::ErrorKind::ConnectionAborted,
            std::io::ErrorKind::ConnectionReset,
        ] {
            assert!(is_transient_accept_error(&std::io::Error::from(kind)));
        }
        assert!(!is_transient_accept_error(&std::io::Error::from(
            std::io::ErrorKind::PermissionDenied
        )));
    }
}
