//! HTTP control surface: `/service/{id}` and the creation-event endpoint.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Request, State};
use axum::http::{HeaderValue, Method, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::events::{CONTAINER_CREATED, ContainerEvent, CreationListener, LocalProvisioner};
use crate::orchestrator::{InfoReport, Orchestrator};

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    /// Process-wide shutdown; per-call tokens derive from it.
    pub shutdown: CancellationToken,
    /// Bound on a single deploy/undeploy call, including graceful stop.
    pub op_timeout: Duration,
}

pub fn service_router(state: ApiState) -> Router {
    Router::new()
        .route("/service/{id}", get(info).put(deploy).delete(undeploy))
        .layer(axum::middleware::from_fn(cors))
        .layer(axum::middleware::from_fn(trace_requests))
        .with_state(state)
}

/// A workload identity is a single non-empty path segment.
pub fn validate_id(id: &str) -> Result<&str> {
    if id.is_empty() || id.contains('/') {
        return Err(Error::InvalidIdentity(id.to_owned()));
    }
    Ok(id)
}

async fn info(State(state): State<ApiState>, Path(id): Path<String>) -> Result<Json<InfoReport>> {
    let id = validate_id(&id)?;

    state.orchestrator.info(id).await.map(Json).map_err(|e| {
        error!(id, error = %e, "info failed");
        e
    })
}

async fn deploy(State(state): State<ApiState>, Path(id): Path<String>) -> Result<Json<&'static str>> {
    let id = validate_id(&id)?;

    with_deadline(&state.shutdown, state.op_timeout, |cancel| async move {
        state.orchestrator.deploy(id, &cancel).await
    })
    .await
    .map_err(|e| {
        error!(id, error = %e, "deploy failed");
        e
    })?;

    Ok(Json("service deployed"))
}

async fn undeploy(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<&'static str>> {
    let id = validate_id(&id)?;

    with_deadline(&state.shutdown, state.op_timeout, |cancel| async move {
        state.orchestrator.undeploy(id, &cancel).await
    })
    .await
    .map_err(|e| {
        error!(id, error = %e, "undeploy failed");
        e
    })?;

    Ok(Json("service undeployed"))
}

/// Runs an orchestrator call under a child of the process shutdown token,
/// cancelling it once the deadline elapses. The operation itself decides how
/// cancellation surfaces (the graceful-stop race).
async fn with_deadline<F, T>(
    shutdown: &CancellationToken,
    deadline: Duration,
    op: impl FnOnce(CancellationToken) -> F,
) -> T
where
    F: Future<Output = T>,
{
    let cancel = shutdown.child_token();
    let trigger = cancel.clone();

    let fut = op(cancel);
    tokio::pin!(fut);

    tokio::select! {
        result = &mut fut => result,
        () = tokio::time::sleep(deadline) => {
            trigger.cancel();
            fut.await
        }
    }
}

#[derive(Clone)]
pub struct EventState {
    pub listener: Arc<LocalProvisioner>,
}

/// Router for the network service side of the split topology.
pub fn event_router(state: EventState) -> Router {
    Router::new()
        .route("/container", post(container_event))
        .layer(axum::middleware::from_fn(cors))
        .layer(axum::middleware::from_fn(trace_requests))
        .with_state(state)
}

async fn container_event(
    State(state): State<EventState>,
    Json(event): Json<ContainerEvent>,
) -> Result<Json<&'static str>> {
    if event.event_type != CONTAINER_CREATED {
        return Ok(Json("Ok"));
    }

    validate_id(&event.id)?;
    if event.namespace.is_empty() {
        return Err(Error::InvalidEvent("empty namespace".to_owned()));
    }

    state
        .listener
        .created(&event.id, &event.namespace)
        .await
        .map_err(|e| {
            error!(id = %event.id, error = %e, "network setup for event failed");
            e
        })?;

    Ok(Json("Network setup ok"))
}

pub async fn trace_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();

    let response = next.run(request).await;

    info!(%method, path, status = response.status().as_u16(), "request");
    response
}

pub async fn cors(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return [
            (header::ALLOW, "OPTIONS, GET, PUT, DELETE, POST"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_METHODS, "GET, PUT, DELETE, POST"),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type"),
        ]
        .into_response();
    }

    let mut response = next.run(request).await;
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}
