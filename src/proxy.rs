//! Dynamic reverse proxy.
//!
//! The first path segment names the workload; the endpoint directory says
//! where it currently lives. The rest of the path is forwarded verbatim and
//! the upstream response is relayed as-is.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, Uri, header};
use axum::response::Response;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::api::{cors, trace_requests};
use crate::endpoint::EndpointDirectory;
use crate::error::{Error, Result};

pub fn router(directory: Arc<EndpointDirectory>) -> Router {
    Router::new()
        .fallback(forward)
        .layer(axum::middleware::from_fn(cors))
        .layer(axum::middleware::from_fn(trace_requests))
        .with_state(directory)
}

/// Splits `/{id}/{rest...}` into the workload identity and the forwarded
/// remainder.
pub fn split_target_path(path: &str) -> (&str, &str) {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    match trimmed.split_once('/') {
        Some((id, rest)) => (id, rest),
        None => (trimmed, ""),
    }
}

async fn forward(
    State(directory): State<Arc<EndpointDirectory>>,
    request: Request,
) -> Result<Response> {
    let (id, rest) = split_target_path(request.uri().path());
    let (id, rest) = (id.to_owned(), rest.to_owned());
    let endpoint = directory.load(&id)?;

    let host = endpoint
        .host()
        .ok_or_else(|| Error::Upstream(format!("endpoint for {id} has no host")))?
        .to_owned();
    let port = endpoint.port_u16().unwrap_or(80);

    debug!(id, host, port, rest, "proxying request");

    let (mut parts, body) = request.into_parts();
    parts.uri = Uri::try_from(format!("/{rest}"))
        .map_err(|e| Error::Upstream(format!("cannot build target path: {e}")))?;
    parts.headers.insert(
        header::HOST,
        HeaderValue::from_str(&format!("{host}:{port}"))
            .map_err(|e| Error::Upstream(e.to_string()))?,
    );

    let stream = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(|e| Error::Upstream(format!("cannot dial {host}:{port}: {e}")))?;

    let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| Error::Upstream(e.to_string()))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(error = %e, "proxy connection error");
        }
    });

    let response = sender
        .send_request(Request::from_parts(parts, body))
        .await
        .map_err(|e| Error::Upstream(e.to_string()))?;

    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, Body::new(body)))
}
