use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dockhand::api::{ApiState, service_router};
use dockhand::config::Config;
use dockhand::endpoint::EndpointDirectory;
use dockhand::error::Result;
use dockhand::events::{CreationListener, LocalProvisioner, NetworkEventClient};
use dockhand::images::{ImageResolver, StaticImageTable};
use dockhand::listen::{self, Listener};
use dockhand::network::cni::CniSetup;
use dockhand::network::{NetworkProvisioner, bridge};
use dockhand::orchestrator::Orchestrator;
use dockhand::runtime::docker::DockerConnector;
use dockhand::tunnel::Tunnel;
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

    let images: Arc<dyn ImageResolver> = match &config.image_table {
        Some(path) => Arc::new(StaticImageTable::load(path)?),
        None => Arc::new(StaticImageTable::builtin()),
    };

    let connector = Arc::new(DockerConnector::new(&config.runtime_socket));
    let directory = Arc::new(EndpointDirectory::new());

    let shutdown = CancellationToken::new();
    let servers = TaskTracker::new();

    // Networking either runs in-process or is delegated to a remote peer
    // that receives creation events.
    let (listener, local_directory): (Arc<dyn CreationListener>, _) = match &config.net_addr {
        Some(addr) => {
            info!(addr, "delegating network setup");
            (Arc::new(NetworkEventClient::new(addr)), None)
        }
        None => {
            bridge::ensure_bridge(&config.bridge).await?;

            let cni = CniSetup::new(
                &config.cni_conf_dir,
                config.cni_plugin_dirs.iter().map(PathBuf::from).collect(),
            );
            let provisioner = LocalProvisioner::new(
                NetworkProvisioner::new(Arc::new(cni)),
                directory.clone(),
                config.service_port,
            );

            let proxy_listener = Listener::bind(&config.proxy_addr).await?;
            info!(addr = %config.proxy_addr, "proxy listening");
            spawn_server(
                &servers,
                "proxy",
                listen::serve(proxy_listener, proxy::router(directory.clone()), shutdown.clone()),
            );

            (Arc::new(provisioner), Some(directory.clone()))
        }
    };

    let orchestrator = Arc::new(Orchestrator::new(
        connector,
        images,
        vec![listener],
        local_directory,
    ));

    let api_listener = Listener::bind(&config.api_addr).await?;
    info!(addr = %config.api_addr, "control api listening");
    spawn_server(
        &servers,
        "control api",
        listen::serve(
            api_listener,
            service_router(ApiState {
                orchestrator,
                shutdown: shutdown.clone(),
                op_timeout: config.stop_timeout,
            }),
            shutdown.clone(),
        ),
    );

    let tunnel = Tunnel::bind(&config.tunnel_addr, &config.proxy_addr).await?;
    let tunnel_handle = tunnel.handle();
    info!(addr = %config.tunnel_addr, dest = %config.proxy_addr, "tunnel listening");
    servers.spawn(async move {
        if let Err(e) = tunnel.serve().await {
            error!(error = %e, "tunnel failed");
        }
    });

    wait_for_signal().await;
    info!("shutting down");
    shutdown.cancel();

    if let Err(e) = tunnel_handle.shutdown(config.shutdown_timeout).await {
        warn!(error = %e, "tunnel connections still draining");
    }

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
