//! Deployment replica endpoints
//!
//! - `GET /deployments?namespace=` lists Deployments, optionally scoped to a
//!   namespace
//! - `GET /deployments/{namespace}/{deployment}/replicas` reads the desired
//!   replica count
//! - `PUT /deployments/{namespace}/{deployment}/replicas` sets it with a JSON
//!   merge patch
//!
//! Every non-2xx JSON response carries an [`ErrorBody`]. Paths under
//! `/deployments/` that name no resource are a client error (400), not a 404.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::store::DeploymentStore;

/// Prefix under which every path belongs to this module
const DEPLOYMENTS_PREFIX: &str = "/deployments/";

/// Name and namespace of a Deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSummary {
    pub name: String,
    pub namespace: String,
}

impl From<&Deployment> for DeploymentSummary {
    fn from(deployment: &Deployment) -> Self {
        Self {
            name: deployment.name_any(),
            namespace: deployment.namespace().unwrap_or_default(),
        }
    }
}

/// Desired replica count, as read from or written to a Deployment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSpec {
    pub replicas: Option<i32>,
}

/// Why a [`ReplicaSpec`] is not a valid update
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicaValidationError {
    #[error("replicas field is required")]
    Missing,
    #[error("replicas field must be greater than or equal to 0")]
    Negative,
}

impl ReplicaSpec {
    /// Validate as an update request and return the requested count
    ///
    /// A missing count is reported before a negative one.
    pub fn validate(&self) -> Result<i32, ReplicaValidationError> {
        match self.replicas {
            None => Err(ReplicaValidationError::Missing),
            Some(n) if n < 0 => Err(ReplicaValidationError::Negative),
            Some(n) => Ok(n),
        }
    }

    /// JSON merge patch setting `spec.replicas` to `replicas`
    pub fn merge_patch(replicas: i32) -> serde_json::Value {
        serde_json::json!({ "spec": { "replicas": replicas } })
    }
}

impl From<&Deployment> for ReplicaSpec {
    fn from(deployment: &Deployment) -> Self {
        Self {
            replicas: deployment.spec.as_ref().and_then(|s| s.replicas),
        }
    }
}

/// Response body of the replica endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentReplicaView {
    #[serde(flatten)]
    pub deployment: DeploymentSummary,
    #[serde(flatten)]
    pub spec: ReplicaSpec,
}

impl From<&Deployment> for DeploymentReplicaView {
    fn from(deployment: &Deployment) -> Self {
        Self {
            deployment: deployment.into(),
            spec: deployment.into(),
        }
    }
}

/// Error envelope for JSON error responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

/// Request failures and the responses they produce
#[derive(Debug, Error)]
pub enum ApiError {
    /// The target Deployment could not be fetched
    #[error("Error getting deployment {name} in namespace {namespace}")]
    NotFound { namespace: String, name: String },

    /// The request body is not valid JSON for a [`ReplicaSpec`]
    #[error("Error parsing request body: {0}")]
    InvalidBody(String),

    /// The request body parsed but fails validation
    #[error("Validation error: {0}")]
    Validation(#[from] ReplicaValidationError),

    /// A path under `/deployments/` that names no resource
    #[error("Invalid deployment path: {0}")]
    InvalidPath(String),

    /// The API server rejected the merge patch
    #[error("Error patching deployment {name} in namespace {namespace}")]
    PatchFailed { namespace: String, name: String },

    /// The Deployment list could not be produced
    #[error("Error listing deployments")]
    ListFailed,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::InvalidBody(_) | ApiError::Validation(_) | ApiError::InvalidPath(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::PatchFailed { .. } | ApiError::ListFailed => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            // List failures carry no body
            ApiError::ListFailed => status.into_response(),
            other => (
                status,
                Json(ErrorBody {
                    message: other.to_string(),
                }),
            )
                .into_response(),
        }
    }
}

/// Query parameters of the list endpoint
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub namespace: Option<String>,
}

/// `GET /deployments`
pub async fn list_deployments(
    State(store): State<Arc<dyn DeploymentStore>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<DeploymentSummary>>, ApiError> {
    let namespace = params.namespace.as_deref().filter(|ns| !ns.is_empty());

    let deployments = store.list(namespace).await.map_err(|e| {
        error!(namespace = ?namespace, error = %e, "Failed to list deployments");
        ApiError::ListFailed
    })?;

    Ok(Json(deployments.iter().map(DeploymentSummary::from).collect()))
}

/// `GET /deployments/{namespace}/{deployment}/replicas`
pub async fn get_replicas(
    State(store): State<Arc<dyn DeploymentStore>>,
    Path((namespace, name)): Path<(String, String)>,
    uri: Uri,
) -> Result<Json<DeploymentReplicaView>, ApiError> {
    check_segments(&namespace, &name, &uri)?;
    let deployment = lookup(store.as_ref(), &namespace, &name).await?;
    Ok(Json(DeploymentReplicaView::from(&deployment)))
}

/// `PUT /deployments/{namespace}/{deployment}/replicas`
pub async fn set_replicas(
    State(store): State<Arc<dyn DeploymentStore>>,
    Path((namespace, name)): Path<(String, String)>,
    uri: Uri,
    body: Bytes,
) -> Result<Json<DeploymentReplicaView>, ApiError> {
    check_segments(&namespace, &name, &uri)?;
    let deployment = lookup(store.as_ref(), &namespace, &name).await?;

    let spec: ReplicaSpec = serde_json::from_slice(&body).map_err(|e| {
        warn!(namespace = %namespace, deployment = %name, error = %e, "Malformed replicas body");
        ApiError::InvalidBody(e.to_string())
    })?;

    let replicas = spec.validate().map_err(|e| {
        warn!(namespace = %namespace, deployment = %name, error = %e, "Rejected replicas update");
        ApiError::from(e)
    })?;

    let patched = store
        .patch(&deployment, &ReplicaSpec::merge_patch(replicas))
        .await
        .map_err(|e| {
            error!(namespace = %namespace, deployment = %name, error = %e, "Failed to patch deployment");
            ApiError::PatchFailed {
                namespace: namespace.clone(),
                name: name.clone(),
            }
        })?;

    info!(namespace = %namespace, deployment = %name, replicas, "Updated deployment replicas");
    Ok(Json(DeploymentReplicaView::from(&patched)))
}

/// Fallback for `/deployments/...` paths that match no route
///
/// GET and PUT get a 400 naming the path; other methods get a bare 405.
pub async fn invalid_path(method: Method, uri: Uri) -> Response {
    if method == Method::GET || method == Method::PUT {
        warn!(method = %method, path = %uri.path(), "Invalid deployment path");
        ApiError::InvalidPath(uri.path().to_string()).into_response()
    } else {
        StatusCode::METHOD_NOT_ALLOWED.into_response()
    }
}

async fn fallback(method: Method, uri: Uri) -> Response {
    if uri.path().starts_with(DEPLOYMENTS_PREFIX) {
        invalid_path(method, uri).await
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

/// Router for the deployment endpoints, including the malformed-path fallback
pub fn router(store: Arc<dyn DeploymentStore>) -> Router {
    Router::new()
        .route("/deployments", get(list_deployments))
        .route(
            "/deployments/{namespace}/{deployment}/replicas",
            get(get_replicas).put(set_replicas),
        )
        .fallback(fallback)
        .with_state(store)
}

fn check_segments(namespace: &str, name: &str, uri: &Uri) -> Result<(), ApiError> {
    if namespace.is_empty() || name.is_empty() {
        return Err(ApiError::InvalidPath(uri.path().to_string()));
    }
    Ok(())
}

async fn lookup(
    store: &dyn DeploymentStore,
    namespace: &str,
    name: &str,
) -> Result<Deployment, ApiError> {
    store.get(namespace, name).await.map_err(|e| {
        warn!(namespace = %namespace, deployment = %name, error = %e, "Failed to get deployment");
        ApiError::NotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::store::memory::{deployment, MemoryStore};

    const NS: &str = "test-namespace";
    const NAME: &str = "test-deployment";
    const REPLICAS_URI: &str = "/deployments/test-namespace/test-deployment/replicas";

    fn seeded() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new(vec![deployment(NS, NAME, Some(3))]))
    }

    async fn send(
        store: Arc<MemoryStore>,
        method: Method,
        uri: &str,
        body: &str,
    ) -> (StatusCode, Bytes) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router(store).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes)
    }

    fn json(bytes: &Bytes) -> serde_json::Value {
        serde_json::from_slice(bytes).unwrap()
    }

    #[test]
    fn test_validate_missing_before_negative() {
        assert_eq!(
            ReplicaSpec { replicas: None }.validate(),
            Err(ReplicaValidationError::Missing)
        );
        assert_eq!(
            ReplicaSpec { replicas: Some(-1) }.validate(),
            Err(ReplicaValidationError::Negative)
        );
        assert_eq!(ReplicaSpec { replicas: Some(0) }.validate(), Ok(0));
    }

    #[test]
    fn test_view_serializes_flat_with_null_replicas() {
        let view = DeploymentReplicaView::from(&deployment("ns", "web", None));
        assert_eq!(
            serde_json::to_value(&view).unwrap(),
            serde_json::json!({"name": "web", "namespace": "ns", "replicas": null})
        );
    }

    #[tokio::test]
    async fn test_list_all_preserves_store_order() {
        let store = Arc::new(MemoryStore::new(vec![
            deployment("ns-b", "beta", Some(1)),
            deployment("ns-a", "alpha", Some(2)),
        ]));

        let (status, body) = send(store, Method::GET, "/deployments", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json(&body),
            serde_json::json!([
                {"name": "beta", "namespace": "ns-b"},
                {"name": "alpha", "namespace": "ns-a"},
            ])
        );
    }

    #[tokio::test]
    async fn test_list_filters_by_namespace() {
        let store = Arc::new(MemoryStore::new(vec![
            deployment("ns-a", "one", None),
            deployment("ns-b", "two", None),
            deployment("ns-a", "three", None),
        ]));

        let (status, body) = send(store.clone(), Method::GET, "/deployments?namespace=ns-a", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json(&body),
            serde_json::json!([
                {"name": "one", "namespace": "ns-a"},
                {"name": "three", "namespace": "ns-a"},
            ])
        );

        let (_, body) = send(store, Method::GET, "/deployments?namespace=", "").await;
        assert_eq!(json(&body).as_array().map(Vec::len), Some(3));
    }

    #[tokio::test]
    async fn test_list_failure_is_500_with_empty_body() {
        let store = Arc::new(MemoryStore::new(vec![]).failing_list());

        let (status, body) = send(store, Method::GET, "/deployments", "").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_get_replicas() {
        let (status, body) = send(seeded(), Method::GET, REPLICAS_URI, "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json(&body),
            serde_json::json!({"name": NAME, "namespace": NS, "replicas": 3})
        );
    }

    #[tokio::test]
    async fn test_unknown_deployment_is_404_for_both_methods() {
        let expected = serde_json::json!({
            "message": "Error getting deployment missing in namespace test-namespace"
        });

        let uri = "/deployments/test-namespace/missing/replicas";
        let (status, body) = send(seeded(), Method::GET, uri, "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json(&body), expected);

        // Lookup happens before the body is parsed
        let (status, body) = send(seeded(), Method::PUT, uri, "not json").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json(&body), expected);
    }

    #[tokio::test]
    async fn test_set_replicas_then_get() {
        let store = seeded();

        let (status, body) =
            send(store.clone(), Method::PUT, REPLICAS_URI, r#"{"replicas":7}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json(&body),
            serde_json::json!({"name": NAME, "namespace": NS, "replicas": 7})
        );

        let (status, body) = send(store.clone(), Method::GET, REPLICAS_URI, "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["replicas"], 7);
        assert_eq!(store.replicas(NS, NAME).await, Some(7));
    }

    #[tokio::test]
    async fn test_set_replicas_to_zero() {
        let store = seeded();
        let (status, _) = send(store.clone(), Method::PUT, REPLICAS_URI, r#"{"replicas":0}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(store.replicas(NS, NAME).await, Some(0));
    }

    #[tokio::test]
    async fn test_misspelled_field_is_required_error() {
        let store = seeded();
        let (status, body) =
            send(store.clone(), Method::PUT, REPLICAS_URI, r#"{"replikas":99}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            json(&body),
            serde_json::json!({"message": "Validation error: replicas field is required"})
        );
        assert_eq!(store.replicas(NS, NAME).await, Some(3));
    }

    #[tokio::test]
    async fn test_negative_replicas_rejected() {
        let store = seeded();
        let (status, body) =
            send(store.clone(), Method::PUT, REPLICAS_URI, r#"{"replicas":-1}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            json(&body),
            serde_json::json!({
                "message": "Validation error: replicas field must be greater than or equal to 0"
            })
        );
        assert_eq!(store.replicas(NS, NAME).await, Some(3));
    }

    #[tokio::test]
    async fn test_malformed_body_is_parse_error() {
        let (status, body) = send(seeded(), Method::PUT, REPLICAS_URI, "{\"replicas\":").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let message = json(&body)["message"].as_str().unwrap().to_string();
        assert!(message.starts_with("Error parsing request body: "));
    }

    #[tokio::test]
    async fn test_patch_failure_is_500() {
        let store = Arc::new(
            MemoryStore::new(vec![deployment(NS, NAME, Some(3))]).failing_patch(),
        );

        let (status, body) = send(store, Method::PUT, REPLICAS_URI, r#"{"replicas":5}"#).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            json(&body),
            serde_json::json!({
                "message": "Error patching deployment test-deployment in namespace test-namespace"
            })
        );
    }

    #[tokio::test]
    async fn test_unsupported_methods_are_405() {
        let (status, body) = send(seeded(), Method::DELETE, REPLICAS_URI, "").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert!(body.is_empty());

        let (status, _) = send(seeded(), Method::POST, "/deployments", "").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_malformed_paths() {
        let (status, body) = send(seeded(), Method::GET, "/deployments/only-namespace", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            json(&body),
            serde_json::json!({"message": "Invalid deployment path: /deployments/only-namespace"})
        );

        let (status, _) = send(
            seeded(),
            Method::PUT,
            "/deployments/test-namespace/test-deployment/scale",
            r#"{"replicas":1}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(seeded(), Method::GET, "/deployments//test-deployment/replicas", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(seeded(), Method::DELETE, "/deployments/only-namespace", "").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_unrelated_path_is_404() {
        let (status, _) = send(seeded(), Method::GET, "/apis/apps/v1", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
