//! Per-workload network provisioning.

pub mod bridge;
pub mod cni;

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;

/// One interface created inside some namespace by the setup mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceReport {
    pub name: String,
    /// Namespace path the interface lives in. Empty for host-side peers.
    pub sandbox: String,
    pub addresses: Vec<IpAddr>,
}

/// Pluggable network-setup mechanism (CNI-style). Given a per-call unique
/// attachment id and a namespace handle it creates a loopback plus a default
/// data-plane interface and reports what it configured.
#[async_trait]
pub trait NetworkSetupMechanism: Send + Sync {
    async fn setup(&self, attachment_id: &str, netns: &str) -> Result<Vec<InterfaceReport>>;
}

/// The result of provisioning a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAllocation {
    pub netns: String,
    /// Addresses assigned to interfaces inside the namespace, in reported
    /// order. Empty is not an error at this layer; callers that need an
    /// address treat it as fatal.
    pub addresses: Vec<IpAddr>,
}

pub struct NetworkProvisioner {
    mechanism: Arc<dyn NetworkSetupMechanism>,
}

impl NetworkProvisioner {
    #[must_use]
    pub fn new(mechanism: Arc<dyn NetworkSetupMechanism>) -> Self {
        Self { mechanism }
    }

    /// Attaches the namespace to the data plane and collects every address
    /// assigned to interfaces reported as belonging to it.
    pub async fn provision(&self, netns: &str) -> Result<NetworkAllocation> {
        let attachment_id = Uuid::new_v4().to_string();
        let interfaces = self.mechanism.setup(&attachment_id, netns).await?;

        let addresses = interfaces
            .into_iter()
            .filter(|interface| interface.sandbox == netns)
            .flat_map(|interface| interface.addresses)
            .collect();

        Ok(NetworkAllocation {
            netns: netns.to_owned(),
            addresses,
        })
    }
}
