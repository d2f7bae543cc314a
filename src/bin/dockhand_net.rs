//! Standalone network service: receives container creation events, wires
//! workloads onto the bridge, and serves the reverse proxy for them.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dockhand::api::{EventState, event_router};
use dockhand::config::Config;
use dockhand::endpoint::EndpointDirectory;
use dockhand::error::Result;
use dockhand::events::LocalProvisioner;
use dockhand::listen::{self, Listener};
use dockhand::network::cni::CniSetup;
use dockhand::network::{NetworkProvisioner, bridge};
use dockhand::{Error, proxy};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env();
    run(config).await
}

async fn run(config: Config) -> Result<()> {
    tokio::fs::create_dir_all(&config.runtime_dir).await?;

    bridge::ensure_bridge(&config.bridge).await?;

    let directory = Arc::new(EndpointDirectory::new());
    let cni = CniSetup::new(
        &config.cni_conf_dir,
        config.cni_plugin_dirs.iter().map(PathBuf::from).collect(),
    );
    let provisioner = Arc::new(LocalProvisioner::new(
        NetworkProvisioner::new(Arc::new(cni)),
        directory.clone(),
        config.service_port,
    ));

    let shutdown = CancellationToken::new();
    let servers = TaskTracker::new();

    let event_listener = Listener::bind(&config.event_addr).await?;
    info!(addr = %config.event_addr, "event listener ready");
    spawn_server(
        &servers,
        "events",
        listen::serve(
            event_listener,
            event_router(EventState {
                listener: provisioner,
            }),
            shutdown.clone(),
        ),
    );

    let proxy_listener = Listener::bind(&config.proxy_addr).await?;
    info!(addr = %config.proxy_addr, "proxy listening");
    spawn_server(
        &servers,
        "proxy",
        listen::serve(proxy_listener, proxy::router(directory), shutdown.clone()),
    );

    wait_for_signal().await;
    info!("shutting down");
    shutdown.cancel();

    servers.close();
    tokio::time::timeout(config.shutdown_timeout, servers.wait())
        .await
        .map_err(|_| Error::ShutdownTimeout("servers".to_owned()))?;

    Ok(())
}

fn spawn_server(
    servers: &TaskTracker,
    name: &'static str,
    server: impl Future<Output = std::io::Result<()>> + Send + 'static,
) {
    servers.spawn(async move {
        if let Err(e) = server.await {
            error!(name, error = %e, "server failed");
        }
    });
}

async fn wait_for_signal() {
    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot install SIGINT handler");
            return;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot install SIGTERM handler");
            return;
        }
    };

    tokio::select! {
        _ = interrupt.recv() => info!("received SIGINT"),
        _ = terminate.recv() => info!("received SIGTERM"),
    }
}
