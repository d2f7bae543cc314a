//! Environment-driven configuration.
//!
//! Every knob has a default that works on a stock Linux host with Docker;
//! `DOCKHAND_*` variables override them one by one.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for runtime state (unix sockets live here).
    pub runtime_dir: String,
    /// Control API listener.
    pub api_addr: String,
    /// Creation-event listener of the network service.
    pub event_addr: String,
    /// When set, networking runs in a separate process reachable at this
    /// address and the local provisioner is disabled.
    pub net_addr: Option<String>,
    /// Public tunnel listener, forwarded to `proxy_addr`.
    pub tunnel_addr: String,
    /// Reverse proxy listener.
    pub proxy_addr: String,
    /// Bridge device the CNI configuration attaches workloads to.
    pub bridge: String,
    /// Container runtime socket.
    pub runtime_socket: String,
    /// Path of a JSON image table; the built-in table is used when unset.
    pub image_table: Option<String>,
    pub cni_conf_dir: String,
    pub cni_plugin_dirs: Vec<String>,
    /// Port every workload is assumed to serve on.
    pub service_port: u16,
    /// Bound on a single deploy/undeploy call.
    pub stop_timeout: Duration,
    /// Bound on draining servers and tunnel pairs at process exit.
    pub shutdown_timeout: Duration,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

impl Config {
    pub fn from_env() -> Self {
        let runtime_dir = var_or("DOCKHAND_RUNTIME_DIR", "/run/dockhand");

        Self {
            api_addr: var_or("DOCKHAND_API_ADDRESS", "0.0.0.0:2077"),
            event_addr: var_or(
                "DOCKHAND_EVENT_ADDRESS",
                &format!("{runtime_dir}/event.sock"),
            ),
            net_addr: env::var("DOCKHAND_NET_ADDRESS").ok(),
            tunnel_addr: var_or("DOCKHAND_TUNNEL_ADDRESS", "0.0.0.0:2020"),
            proxy_addr: var_or(
                "DOCKHAND_PROXY_ADDRESS",
                &format!("{runtime_dir}/proxy.sock"),
            ),
            bridge: var_or("DOCKHAND_BRIDGE", "dockhand0"),
            runtime_socket: var_or("DOCKHAND_RUNTIME_SOCKET", "/var/run/docker.sock"),
            image_table: env::var("DOCKHAND_IMAGE_TABLE").ok(),
            cni_conf_dir: var_or("DOCKHAND_CNI_CONF_DIR", "/etc/cni/net.d"),
            cni_plugin_dirs: var_or("DOCKHAND_CNI_PLUGIN_DIRS", "/opt/cni/bin:/usr/lib/cni")
                .split(':')
                .filter(|d| !d.is_empty())
                .map(str::to_owned)
                .collect(),
            service_port: env::var("DOCKHAND_SERVICE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            stop_timeout: Duration::from_secs(
                env::var("DOCKHAND_STOP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|t| t.parse().ok())
                    .unwrap_or(10),
            ),
            shutdown_timeout: Duration::from_secs(
                env::var("DOCKHAND_SHUTDOWN_TIMEOUT_SECS")
                    .ok()
                    .and_then(|t| t.parse().ok())
                    .unwrap_or(10),
            ),
            runtime_dir,
        }
    }
}
