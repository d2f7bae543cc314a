//! Typed errors shared by every subsystem, with their HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("workload {0} not found")]
    NotFound(String),

    #[error("invalid workload identity {0:?}")]
    InvalidIdentity(String),

    #[error("invalid creation event: {0}")]
    InvalidEvent(String),

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("image pull failed: {0}")]
    ImagePull(String),

    #[error("network setup failed: {0}")]
    NetworkSetup(String),

    #[error("conflicting host network state: {0}")]
    Configuration(String),

    #[error("graceful stop of {0} did not finish in time")]
    ShutdownTimeout(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("runtime operation failed: {0}")]
    Runtime(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidIdentity(_) | Self::InvalidEvent(_) => StatusCode::BAD_REQUEST,
            Self::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::ShutdownTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::ImagePull(_)
            | Self::NetworkSetup(_)
            | Self::Configuration(_)
            | Self::Runtime(_)
            | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Internal detail is logged at the call site, never echoed back.
        let message = match &self {
            Self::NotFound(id) => format!("workload {id} not found"),
            Self::InvalidIdentity(_) => "invalid workload identity".to_owned(),
            Self::InvalidEvent(_) => "invalid creation event".to_owned(),
            Self::RuntimeUnavailable(_) => "container runtime unavailable".to_owned(),
            Self::ImagePull(_) => "image pull failed".to_owned(),
            Self::NetworkSetup(_) => "network setup failed".to_owned(),
            Self::ShutdownTimeout(_) => "graceful stop timed out".to_owned(),
            Self::Upstream(_) => "upstream request failed".to_owned(),
            Self::Configuration(_) | Self::Runtime(_) | Self::Io(_) => {
                "internal error".to_owned()
            }
        };

        (status, Json(json!({ "message": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(
            Error::NotFound("web".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::InvalidIdentity("a/b".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::ShutdownTimeout("web".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            Error::RuntimeUnavailable("refused".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::NetworkSetup("cni".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
