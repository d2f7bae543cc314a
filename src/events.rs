//! Creation notifications.
//!
//! When a task is created the orchestrator tells its creation listeners
//! about the new network namespace before the task starts. In the
//! single-process topology the listener provisions the namespace and writes
//! the endpoint directory directly; in the split topology it posts the event
//! to the network service, which does the same on its side of the process
//! boundary. Both live behind [`CreationListener`], so the orchestrator
//! cannot tell the topologies apart.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::Uri;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper::{Method, Request, StatusCode, header};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::endpoint::EndpointDirectory;
use crate::error::{Error, Result};
use crate::listen;
use crate::network::NetworkProvisioner;

pub const CONTAINER_CREATED: &str = "CREATED";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub id: String,
    pub namespace: String,
}

impl ContainerEvent {
    #[must_use]
    pub fn created(id: &str, netns: &str) -> Self {
        Self {
            event_type: CONTAINER_CREATED.to_owned(),
            id: id.to_owned(),
            namespace: netns.to_owned(),
        }
    }
}

/// Notified after a task is created and before it is started.
#[async_trait]
pub trait CreationListener: Send + Sync {
    async fn created(&self, id: &str, netns: &str) -> Result<()>;
}

/// Single-process topology: provision the namespace and record the endpoint
/// in the local directory.
pub struct LocalProvisioner {
    provisioner: NetworkProvisioner,
    directory: Arc<EndpointDirectory>,
    service_port: u16,
}

impl LocalProvisioner {
    #[must_use]
    pub fn new(
        provisioner: NetworkProvisioner,
        directory: Arc<EndpointDirectory>,
        service_port: u16,
    ) -> Self {
        Self {
            provisioner,
            directory,
            service_port,
        }
    }
}

#[async_trait]
impl CreationListener for LocalProvisioner {
    async fn created(&self, id: &str, netns: &str) -> Result<()> {
        let allocation = self.provisioner.provision(netns).await?;

        let Some(address) = allocation.addresses.first() else {
            return Err(Error::NetworkSetup(format!(
                "no ip address was assigned in {netns}"
            )));
        };

        let endpoint: Uri = format!("http://{address}:{}/", self.service_port)
            .parse()
            .map_err(|e| Error::NetworkSetup(format!("bad endpoint address: {e}")))?;

        info!(id, %endpoint, "endpoint registered");
        self.directory.store(id, endpoint);
        Ok(())
    }
}

/// Split topology: forward the creation event to the network service over a
/// local HTTP call (unix socket or TCP).
pub struct NetworkEventClient {
    addr: String,
}

impl NetworkEventClient {
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl CreationListener for NetworkEventClient {
    async fn created(&self, id: &str, netns: &str) -> Result<()> {
        let event = ContainerEvent::created(id, netns);
        let body = serde_json::to_vec(&event).map_err(|e| Error::NetworkSetup(e.to_string()))?;

        let stream = listen::connect(&self.addr)
            .await
            .map_err(|e| Error::NetworkSetup(format!("cannot reach network service: {e}")))?;

        let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| Error::NetworkSetup(format!("cannot reach network service: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "event connection error");
            }
        });

        let request = Request::builder()
            .method(Method::POST)
            .uri("/container")
            .header(header::HOST, "dockhand-net")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| Error::NetworkSetup(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| Error::NetworkSetup(format!("event delivery failed: {e}")))?;

        if response.status() != StatusCode::OK {
            return Err(Error::NetworkSetup(format!(
                "network service rejected creation of {id}: {}",
                response.status()
            )));
        }

        Ok(())
    }
}
