//! Network setup by executing CNI plugins.
//!
//! Loads the first network configuration from the conf directory, pairs it
//! with a built-in loopback network, and invokes each plugin binary with the
//! standard CNI environment and the configuration on stdin. The plugin's
//! JSON result is translated into [`InterfaceReport`]s.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{InterfaceReport, NetworkSetupMechanism};
use crate::error::{Error, Result};

const CNI_VERSION: &str = "0.4.0";
const DEFAULT_IFNAME: &str = "eth0";
const LOOPBACK_IFNAME: &str = "lo";

pub struct CniSetup {
    conf_dir: PathBuf,
    plugin_dirs: Vec<PathBuf>,
}

struct NetworkConf {
    ifname: &'static str,
    plugin: String,
    config: Value,
}

impl CniSetup {
    #[must_use]
    pub fn new(conf_dir: impl Into<PathBuf>, plugin_dirs: Vec<PathBuf>) -> Self {
        Self {
            conf_dir: conf_dir.into(),
            plugin_dirs,
        }
    }

    fn loopback_network() -> NetworkConf {
        NetworkConf {
            ifname: LOOPBACK_IFNAME,
            plugin: "loopback".to_owned(),
            config: json!({
                "cniVersion": CNI_VERSION,
                "name": "dockhand-loopback",
                "type": "loopback",
            }),
        }
    }

    /// First network config in the conf dir, by file name order.
    async fn load_default_network(&self) -> Result<NetworkConf> {
        let path = first_conf_file(&self.conf_dir).await?;
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::NetworkSetup(format!("cannot read {}: {e}", path.display())))?;

        let mut config: Value = serde_json::from_slice(&data)
            .map_err(|e| Error::NetworkSetup(format!("invalid config {}: {e}", path.display())))?;

        let plugin = config
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::NetworkSetup(format!("config {} has no plugin type", path.display()))
            })?
            .to_owned();

        if config.get("cniVersion").is_none() {
            config["cniVersion"] = json!(CNI_VERSION);
        }

        Ok(NetworkConf {
            ifname: DEFAULT_IFNAME,
            plugin,
            config,
        })
    }

    async fn find_plugin(&self, name: &str) -> Result<PathBuf> {
        for dir in &self.plugin_dirs {
            let candidate = dir.join(name);
            if tokio::fs::metadata(&candidate).await.is_ok() {
                return Ok(candidate);
            }
        }

        Err(Error::NetworkSetup(format!(
            "plugin {name} not found in {:?}",
            self.plugin_dirs
        )))
    }

    async fn attach(
        &self,
        network: &NetworkConf,
        attachment_id: &str,
        netns: &str,
    ) -> Result<Vec<InterfaceReport>> {
        let plugin = self.find_plugin(&network.plugin).await?;
        let cni_path = std::env::join_paths(&self.plugin_dirs)
            .map_err(|e| Error::NetworkSetup(format!("bad plugin dirs: {e}")))?;

        let mut child = Command::new(&plugin)
            .env("CNI_COMMAND", "ADD")
            .env("CNI_CONTAINERID", attachment_id)
            .env("CNI_NETNS", netns)
            .env("CNI_IFNAME", network.ifname)
            .env("CNI_PATH", cni_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::NetworkSetup(format!("cannot run {}: {e}", plugin.display()))
            })?;

        let config = serde_json::to_vec(&network.config)
            .map_err(|e| Error::NetworkSetup(e.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&config)
                .await
                .map_err(|e| Error::NetworkSetup(format!("cannot feed plugin: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::NetworkSetup(format!("plugin {} failed: {e}", network.plugin)))?;

        if !output.status.success() {
            return Err(Error::NetworkSetup(plugin_failure(
                &network.plugin,
                &output.stdout,
                &output.stderr,
            )));
        }

        debug!(plugin = %network.plugin, netns, "attachment added");
        parse_result(&output.stdout)
    }
}

#[async_trait]
impl NetworkSetupMechanism for CniSetup {
    async fn setup(&self, attachment_id: &str, netns: &str) -> Result<Vec<InterfaceReport>> {
        let networks = [Self::loopback_network(), self.load_default_network().await?];

        let mut reports = Vec::new();
        for network in &networks {
            reports.extend(self.attach(network, attachment_id, netns).await?);
        }

        Ok(reports)
    }
}

async fn first_conf_file(dir: &Path) -> Result<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| Error::NetworkSetup(format!("cannot read {}: {e}", dir.display())))?;

    let mut candidates = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::NetworkSetup(e.to_string()))?
    {
        let path = entry.path();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("conf" | "json") => candidates.push(path),
            _ => {}
        }
    }

    candidates.sort();
    candidates.into_iter().next().ok_or_else(|| {
        Error::NetworkSetup(format!("no network config found in {}", dir.display()))
    })
}

fn plugin_failure(plugin: &str, stdout: &[u8], stderr: &[u8]) -> String {
    // Failed plugins report {"code": ..., "msg": ...} on stdout.
    #[derive(Deserialize)]
    struct CniError {
        msg: String,
    }

    if let Ok(err) = serde_json::from_slice::<CniError>(stdout) {
        return format!("plugin {plugin}: {}", err.msg);
    }

    format!(
        "plugin {plugin} failed: {}",
        String::from_utf8_lossy(stderr).trim()
    )
}

#[derive(Deserialize)]
struct CniResult {
    #[serde(default)]
    interfaces: Vec<CniInterface>,
    #[serde(default)]
    ips: Vec<CniIp>,
}

#[derive(Deserialize)]
struct CniInterface {
    name: String,
    #[serde(default)]
    sandbox: String,
}

#[derive(Deserialize)]
struct CniIp {
    address: String,
    interface: Option<usize>,
}

fn parse_result(stdout: &[u8]) -> Result<Vec<InterfaceReport>> {
    let result: CniResult = serde_json::from_slice(stdout)
        .map_err(|e| Error::NetworkSetup(format!("invalid plugin result: {e}")))?;

    let mut reports: Vec<InterfaceReport> = result
        .interfaces
        .into_iter()
        .map(|interface| InterfaceReport {
            name: interface.name,
            sandbox: interface.sandbox,
            addresses: Vec::new(),
        })
        .collect();

    for ip in result.ips {
        let address = parse_cidr_address(&ip.address)?;

        // Addresses without an interface index go to the first sandboxed
        // interface, which is where single-interface plugins put them.
        let slot = match ip.interface {
            Some(index) => reports.get_mut(index),
            None => reports.iter_mut().find(|report| !report.sandbox.is_empty()),
        };

        if let Some(report) = slot {
            report.addresses.push(address);
        }
    }

    Ok(reports)
}

fn parse_cidr_address(address: &str) -> Result<IpAddr> {
    let bare = address.split('/').next().unwrap_or(address);
    bare.parse()
        .map_err(|e| Error::NetworkSetup(format!("bad address {address}: {e}")))
}
