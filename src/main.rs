//! Upstream proxy (v1)
//!
//! # Architecture Overview
//!
//! ```text
//!     Client ──▶ net::listener ──▶ http::server ──▶ routing
//!                                                      │
//!                                                      ▼
//!                                          upstream::UpstreamSession
//!                                          │  load_balancer (peer)
//!                                          │  keepalive / connector
//!                                          │  forwarder + header
//!                                          │  failover (next peer)
//!                                          ▼
//!     Client ◀──────── relay (streaming | buffered + spill) ◀── Peer
//!
//!     Cross-cutting: config (+ hot reload), health, observability,
//!     lifecycle (signals, drain), admin API
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use upstream_proxy::admin::setup_admin_router;
use upstream_proxy::config::load_config;
use upstream_proxy::config::watcher::ConfigWatcher;
use upstream_proxy::lifecycle::handle_signals;
use upstream_proxy::net::Listener;
use upstream_proxy::observability::{logging, metrics};
use upstream_proxy::{AppState, HttpServer, Shutdown};

#[derive(Parser)]
#[command(name = "upstream-proxy", version, about = "HTTP proxy with upstream failover")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "upstream-proxy.toml")]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    logging::init_logging(&config.observability);

    if cli.check {
        println!("{}: configuration ok", cli.config.display());
        return Ok(());
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        upstreams = config.upstreams.len(),
        routes = config.routes.len(),
        "upstream-proxy starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics exporter");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let state = AppState::from_config(config.clone()).await?;
    let shutdown = Arc::new(Shutdown::new());

    let listener = Listener::bind(&config.listener).await?;
    let server = HttpServer::new(listener, state.clone());
    let server_task = tokio::spawn(server.run(shutdown.subscribe()));

    if config.admin.enabled {
        let admin_listener = TcpListener::bind(&config.admin.bind_address).await?;
        tracing::info!(address = %config.admin.bind_address, "Admin API listening");
        let router = setup_admin_router(state.clone());
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            let serve = axum::serve(admin_listener, router).with_graceful_shutdown(async move {
                let _ = stop.recv().await;
            });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "Admin API failed");
            }
        });
    }

    // Reloads from the file watcher and SIGHUP arrive on the same channel.
    let (watcher, mut updates) = ConfigWatcher::new(&cli.config);
    let trigger = watcher.reload_trigger();
    let _watcher = match watcher.run() {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::warn!(error = %e, "Config file watching disabled");
            None
        }
    };
    {
        let state = state.clone();
        tokio::spawn(async move {
            while let Some(next) = updates.recv().await {
                if next.listener.bind_address != state.config().listener.bind_address {
                    tracing::warn!("listener.bind_address changes need a restart");
                }
                match state.reload(next).await {
                    Ok(()) => tracing::info!("Configuration reloaded"),
                    Err(e) => tracing::error!(error = %e, "Reload failed, keeping current configuration"),
                }
            }
        });
    }

    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            let reload = move || {
                trigger.reload();
            };
            if let Err(e) = handle_signals(&shutdown, reload).await {
                tracing::error!(error = %e, "Signal handling failed");
            }
        });
    }

    {
        let state = state.clone();
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            if stop.recv().await.is_ok() {
                state.registry().shutdown_pools();
            }
        });
    }

    server_task.await??;
    tracing::info!("Shutdown complete");
    Ok(())
}
