//! Error types for replica-gate
//!
//! These are the fatal errors raised while starting or running the gateway.
//! Per-request failures never surface here; handlers turn them into HTTP
//! responses at the point of failure (see [`crate::deployments::ApiError`]).

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gateway
#[derive(Debug, Error)]
pub enum Error {
    /// A TLS input file could not be read
    #[error("failed to read {path:?}: {source}")]
    Io {
        /// File that could not be read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// TLS material was present but unusable
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// The kubeconfig could not be turned into a client configuration
    #[error("kubeconfig error: {0}")]
    Kubeconfig(String),

    /// The kubeconfig failed to load and the process is not running in a cluster
    #[error(
        "kubeconfig failed to load and not running in cluster, cannot continue \
         (kubeconfig error: {kubeconfig_error}). Please provide a valid kubeconfig \
         file or run in-cluster"
    )]
    NotInCluster {
        /// Why the kubeconfig attempt failed
        kubeconfig_error: String,
    },

    /// Running in a cluster, but the service-account configuration is unusable
    #[error("error getting in-cluster config: {0}")]
    InCluster(String),

    /// Kubernetes client error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A listener could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that could not be bound
        addr: SocketAddr,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A listener or background task failed while running
    #[error("{task} failed: {message}")]
    Task {
        /// Name of the task that failed (e.g. "management server")
        task: &'static str,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a TLS configuration error
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create a task failure error
    pub fn task(task: &'static str, msg: impl Into<String>) -> Self {
        Self::Task {
            task,
            message: msg.into(),
        }
    }
}
