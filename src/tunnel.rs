//! Raw byte-stream tunnel.
//!
//! Forwards every accepted connection, byte for byte and full duplex, to one
//! fixed destination. Used to bridge a public TCP listener to the proxy
//! listening on a private unix socket. Shutdown stops accepting and waits
//! for in-flight connection pairs to finish; it never force-kills them.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::listen::{self, Listener, Stream};

pub struct Tunnel {
    dest: String,
    listener: Listener,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

/// Clonable control surface for a running tunnel.
#[derive(Clone)]
pub struct TunnelHandle {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Tunnel {
    pub async fn bind(listen_addr: &str, dest_addr: &str) -> std::io::Result<Self> {
        Ok(Self {
            dest: dest_addr.to_owned(),
            listener: Listener::bind(listen_addr).await?,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    #[must_use]
    pub fn handle(&self) -> TunnelHandle {
        TunnelHandle {
            tracker: self.tracker.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Accepts until shut down. Returning drops the listener, which is the
    /// single close of the accepting socket.
    pub async fn serve(self) -> std::io::Result<()> {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                accepted = self.listener.accept() => {
                    let src = accepted?;
                    let dest = self.dest.clone();
                    self.tracker.spawn(async move {
                        handle_connection(src, &dest).await;
                    });
                }
            }
        }
    }
}

impl TunnelHandle {
    /// Stops accepting (idempotent) and waits for in-flight pairs, bounded
    /// by `deadline`. On timeout the pairs keep draining in the background.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        self.cancel.cancel();
        self.tracker.close();

        tokio::time::timeout(deadline, self.tracker.wait())
            .await
            .map_err(|_| Error::ShutdownTimeout("tunnel".to_owned()))
    }
}

/// Runs both directional copy loops; the pair is finished when both have
/// returned, at which point the sockets drop closed.
async fn handle_connection(src: Stream, dest: &str) {
    let dst = match listen::connect(dest).await {
        Ok(dst) => dst,
        Err(e) => {
            warn!(dest, error = %e, "cannot connect to tunnel destination");
            return;
        }
    };

    let (mut src_read, mut src_write) = tokio::io::split(src);
    let (mut dst_read, mut dst_write) = tokio::io::split(dst);

    let outbound = async {
        if let Err(e) = tokio::io::copy(&mut src_read, &mut dst_write).await {
            debug!(error = %e, "outbound stream ended");
        }
        let _ = dst_write.shutdown().await;
    };

    let inbound = async {
        if let Err(e) = tokio::io::copy(&mut dst_read, &mut src_write).await {
            debug!(error = %e, "inbound stream ended");
        }
        let _ = src_write.shutdown().await;
    };

    tokio::join!(outbound, inbound);
}
