mod config;
mod netns;
mod resolver;
mod server;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::ForwarderConfig;
use crate::netns::{Dialer, NetnsDialer};
use crate::resolver::Resolver;
use crate::server::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = ForwarderConfig::from_env()?;
    init_tracing(&cfg.log_level);
    info!(
        config_root = %cfg.config_root.display(),
        netns_root = %cfg.netns_root,
        listeners = cfg.listeners.len(),
        domain_prefix = %cfg.domain_prefix,
        domain_suffix = %cfg.domain_suffix,
        "starting forwarder"
    );

    let resolver = Arc::new(Resolver::new(
        cfg.config_root.clone(),
        &cfg.domain_prefix,
        &cfg.domain_suffix,
        cfg.resolver_cache_ttl,
    ));
    let dialer: Arc<dyn Dialer> = Arc::new(NetnsDialer::new(cfg.dial_timeout, &cfg.netns_root));
    let server = Arc::new(Server::new(cfg, resolver, dialer)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.run(shutdown_rx).await?;
    info!("forwarder stopped");
    Ok(())
}

fn init_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            warn!(error = %err, "failed to register SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
