mod config;
mod core;
mod features;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use crate::core::allocator::Allocator;
use crate::core::hooks::HookRunner;
use crate::core::systemd::ExecClient;
use crate::features::vms::service::Service;
use crate::features::vms::store::FsStore;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<Service>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::from_env();
    init_tracing(&cfg.log_level);
    info!(pid = std::process::id(), log_level = %cfg.log_level, "bootstrapping daemon");

    let store = FsStore::new(
        &cfg.config_root,
        &cfg.data_root,
        &cfg.run_root,
        &cfg.global_hooks_dir,
    );
    store.ensure_base_dirs().context("create base directories")?;

    let systemd = Arc::new(ExecClient::new(
        &cfg.systemctl_path,
        &cfg.unit_prefix,
        cfg.command_timeout,
    ));
    let allocator = Allocator::new(cfg.port_start, cfg.port_end, &cfg.guest_cidr);
    let service = Arc::new(Service::new(store, systemd, HookRunner::new(), allocator));

    let app = features::router(AppState { service });
    let addr = cfg.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(addr = %addr, "daemon started");

    let shutdown_timeout = cfg.shutdown_timeout;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            tokio::spawn(async move {
                tokio::time::sleep(shutdown_timeout).await;
                error!("graceful shutdown deadline exceeded, aborting");
                std::process::exit(1);
            });
        })
        .await?;

    info!("daemon stopped");
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
