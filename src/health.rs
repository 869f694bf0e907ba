//! Health endpoint
//!
//! `GET /healthz` reports the API server's own health. The upstream body is
//! passed through verbatim when it is anything other than `ok`.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use kube::client::Body;
use kube::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

/// Path probed on the API server
pub const UPSTREAM_HEALTH_PATH: &str = "/healthz";

/// Response body of the health endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
}

/// Why the upstream health body could not be obtained
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The request failed or the API server answered with an error status
    #[error("{0}")]
    Transport(String),
    /// The response body could not be read
    #[error("{0}")]
    Body(String),
}

/// Fetches the raw health body from the API server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> Result<String, ProbeError>;
}

/// [`HealthProbe`] that calls `/healthz` through the shared client
#[derive(Clone)]
pub struct KubeHealthProbe {
    client: Client,
}

impl KubeHealthProbe {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for KubeHealthProbe {
    async fn probe(&self) -> Result<String, ProbeError> {
        let request = http::Request::get(UPSTREAM_HEALTH_PATH)
            .body(Body::empty())
            .map_err(|e| ProbeError::Transport(e.to_string()))?;

        let response = self
            .client
            .send(request)
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect_bytes()
            .await
            .map_err(|e| ProbeError::Body(e.to_string()))?;
        let body = String::from_utf8_lossy(&bytes).into_owned();

        if !status.is_success() {
            return Err(ProbeError::Transport(format!(
                "{}: {}",
                status,
                body.trim()
            )));
        }

        Ok(body)
    }
}

/// Map a probe outcome to the endpoint's status code and body
pub fn health_response(result: Result<String, ProbeError>) -> (StatusCode, HealthStatus) {
    match result {
        Err(ProbeError::Transport(cause)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            HealthStatus {
                status: format!("Error: {}", cause),
            },
        ),
        Err(ProbeError::Body(cause)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            HealthStatus {
                status: format!("Error reading response: {}", cause),
            },
        ),
        Ok(body) if body == "ok" => (
            StatusCode::OK,
            HealthStatus {
                status: "ok".to_string(),
            },
        ),
        Ok(body) => (
            StatusCode::SERVICE_UNAVAILABLE,
            HealthStatus {
                status: format!("unhealthy: {}", body),
            },
        ),
    }
}

/// `GET /healthz`
pub async fn healthz(State(probe): State<Arc<dyn HealthProbe>>) -> Response {
    let (status, body) = health_response(probe.probe().await);
    if status.is_success() {
        debug!("Upstream health check passed");
    } else {
        warn!(status = %status, detail = %body.status, "Upstream health check failed");
    }
    (status, Json(body)).into_response()
}

/// Router serving only `GET /healthz`
pub fn router(probe: Arc<dyn HealthProbe>) -> Router {
    Router::new().route("/healthz", get(healthz)).with_state(probe)
}
