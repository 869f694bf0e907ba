//! Deployment object store
//!
//! Handlers read Deployments through the [`DeploymentStore`] trait. The
//! production implementation serves reads from a kube-rs reflector cache that
//! [`DeploymentSync`] keeps up to date, and sends patches straight to the API
//! server.
//!
//! Reads are eventually consistent: a `get` right after a `patch` may still
//! return the previous object until the watch delivers the update. Reads wait
//! at most [`DEFAULT_READY_TIMEOUT`] for the initial sync before failing.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// How long a read waits for the cache's initial sync
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Watch timeout (seconds) - must be less than the client read_timeout (30s)
/// so the API server closes idle watches before the client gives up on them.
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Errors returned by a [`DeploymentStore`]
#[derive(Debug, Error)]
pub enum StoreError {
    /// No Deployment with this namespace and name is known
    #[error("deployment {name} not found in namespace {namespace}")]
    NotFound {
        /// Namespace that was searched
        namespace: String,
        /// Deployment name that was searched for
        name: String,
    },

    /// The patch base carries no namespace
    #[error("deployment {0} has no namespace")]
    MissingNamespace(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The backing store cannot serve requests
    #[error("object store error: {0}")]
    Backend(String),
}

/// Read and patch access to Deployments
///
/// Implementations must be safe to call concurrently from many requests.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// List Deployments, restricted to `namespace` when given
    ///
    /// Results come back in the store's own iteration order.
    async fn list(&self, namespace: Option<&str>) -> std::result::Result<Vec<Deployment>, StoreError>;

    /// Fetch a single Deployment
    async fn get(&self, namespace: &str, name: &str) -> std::result::Result<Deployment, StoreError>;

    /// Apply a JSON merge patch to `base` and return the patched object
    async fn patch(
        &self,
        base: &Deployment,
        merge_patch: &serde_json::Value,
    ) -> std::result::Result<Deployment, StoreError>;
}

/// A background process that keeps an object store synchronized
///
/// The runtime runs it on its own task until `shutdown` fires.
pub trait ObjectStoreSync: Send + 'static {
    /// Run until `shutdown` is cancelled or the sync fails
    fn run(self, shutdown: CancellationToken) -> impl Future<Output = Result<()>> + Send;
}

/// Reflector-backed [`DeploymentStore`]
#[derive(Clone)]
pub struct CachedDeploymentStore {
    reader: Store<Deployment>,
    client: Client,
    ready_timeout: Duration,
}

/// Watch loop feeding a [`CachedDeploymentStore`]
pub struct DeploymentSync {
    api: Api<Deployment>,
    writer: reflector::store::Writer<Deployment>,
}

impl CachedDeploymentStore {
    /// Create a store over all namespaces and the sync loop that fills it
    pub fn new(client: Client) -> (Self, DeploymentSync) {
        let (reader, writer) = reflector::store::<Deployment>();
        let sync = DeploymentSync {
            api: Api::all(client.clone()),
            writer,
        };
        let store = Self {
            reader,
            client,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        };
        (store, sync)
    }

    /// Override how long reads wait for the initial sync
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    async fn ready(&self) -> std::result::Result<(), StoreError> {
        match tokio::time::timeout(self.ready_timeout, self.reader.wait_until_ready()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(StoreError::Backend(e.to_string())),
            Err(_) => Err(StoreError::Backend(format!(
                "deployment cache not synced after {:?}",
                self.ready_timeout
            ))),
        }
    }
}

#[async_trait]
impl DeploymentStore for CachedDeploymentStore {
    async fn list(&self, namespace: Option<&str>) -> std::result::Result<Vec<Deployment>, StoreError> {
        self.ready().await?;
        Ok(self
            .reader
            .state()
            .into_iter()
            .filter(|d| namespace.is_none() || d.namespace().as_deref() == namespace)
            .map(|d| d.as_ref().clone())
            .collect())
    }

    async fn get(&self, namespace: &str, name: &str) -> std::result::Result<Deployment, StoreError> {
        self.ready().await?;
        self.reader
            .get(&ObjectRef::new(name).within(namespace))
            .map(|d| d.as_ref().clone())
            .ok_or_else(|| StoreError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn patch(
        &self,
        base: &Deployment,
        merge_patch: &serde_json::Value,
    ) -> std::result::Result<Deployment, StoreError> {
        let name = base.name_any();
        let namespace = base
            .namespace()
            .ok_or_else(|| StoreError::MissingNamespace(name.clone()))?;

        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        let patched = api
            .patch(&name, &PatchParams::default(), &Patch::Merge(merge_patch))
            .await?;

        Ok(patched)
    }
}

impl ObjectStoreSync for DeploymentSync {
    async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!("Starting deployment cache sync");

        let stream = reflector::reflector(
            self.writer,
            watcher(self.api, watch_config()).default_backoff(),
        )
        .applied_objects();
        tokio::pin!(stream);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Deployment cache sync stopped");
                    return Ok(());
                }
                event = stream.next() => match event {
                    Some(Ok(deployment)) => {
                        debug!(
                            deployment = %deployment.name_any(),
                            namespace = ?deployment.namespace(),
                            "Deployment cache updated"
                        );
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Deployment watch error, backing off");
                    }
                    None => {
                        return Err(Error::task("deployment sync", "watch stream ended"));
                    }
                }
            }
        }
    }
}

fn watch_config() -> watcher::Config {
    watcher::Config::default().timeout(WATCH_TIMEOUT_SECS)
}
