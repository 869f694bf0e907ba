//! Cluster credential resolution
//!
//! Determines how the gateway reaches the Kubernetes API server. An explicit
//! kubeconfig (or kube's default kubeconfig lookup) is tried first; if that
//! fails, in-cluster service-account credentials are used. Resolution happens
//! exactly once at startup and is never retried.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Config;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Environment variable injected into every pod with the API server host
pub const SERVICE_HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";
/// Environment variable injected into every pod with the API server port
pub const SERVICE_PORT_ENV: &str = "KUBERNETES_SERVICE_PORT";

/// Connect timeout applied to the resolved client config
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Read timeout applied to the resolved client config
pub(crate) const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the cluster credentials came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Kubeconfig file given on the command line
    Kubeconfig(PathBuf),
    /// Kubeconfig found through `KUBECONFIG` or `~/.kube/config`
    DefaultKubeconfig,
    /// Service-account token and CA mounted into the pod
    InCluster,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Kubeconfig(path) => write!(f, "kubeconfig {}", path.display()),
            CredentialSource::DefaultKubeconfig => write!(f, "default kubeconfig"),
            CredentialSource::InCluster => write!(f, "in-cluster service account"),
        }
    }
}

/// Resolved cluster connection configuration
///
/// Immutable after startup; the `kube::Client` built from it is shared by
/// every request.
#[derive(Clone)]
pub struct ClusterCredentials {
    /// Client configuration for the API server
    pub config: Config,
    /// Which step of the fallback chain produced the config
    pub source: CredentialSource,
}

impl ClusterCredentials {
    /// Build the shared Kubernetes client
    pub fn client(&self) -> Result<kube::Client> {
        Ok(kube::Client::try_from(self.config.clone())?)
    }
}

/// Resolve cluster credentials using the process environment
pub async fn resolve(kubeconfig: Option<&Path>) -> Result<ClusterCredentials> {
    resolve_with(kubeconfig, |key| std::env::var(key).ok()).await
}

/// Resolve cluster credentials, reading pod environment through `lookup`
pub async fn resolve_with<F>(kubeconfig: Option<&Path>, lookup: F) -> Result<ClusterCredentials>
where
    F: Fn(&str) -> Option<String>,
{
    debug!(kubeconfig = ?kubeconfig, "Trying to load kubeconfig");

    let kubeconfig_error = match load_kubeconfig(kubeconfig).await {
        Ok(credentials) => {
            info!(source = %credentials.source, "Using kubeconfig credentials");
            return Ok(with_timeouts(credentials));
        }
        Err(e) => e,
    };

    warn!(error = %kubeconfig_error, "Error loading kubeconfig, trying in-cluster config");

    if !is_in_cluster(&lookup) {
        return Err(Error::NotInCluster {
            kubeconfig_error: kubeconfig_error.to_string(),
        });
    }

    let config = Config::incluster().map_err(|e| Error::InCluster(e.to_string()))?;
    info!("Using in-cluster config");

    Ok(with_timeouts(ClusterCredentials {
        config,
        source: CredentialSource::InCluster,
    }))
}

/// Whether the pod environment advertises an API server
///
/// Mirrors the check client libraries use to decide they are not in a
/// cluster: both the service host and port must be set and non-empty.
pub fn is_in_cluster<F>(lookup: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    let present = |key: &str| lookup(key).is_some_and(|v| !v.is_empty());
    present(SERVICE_HOST_ENV) && present(SERVICE_PORT_ENV)
}

async fn load_kubeconfig(path: Option<&Path>) -> Result<ClusterCredentials> {
    let options = KubeConfigOptions::default();
    match path {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| Error::Kubeconfig(format!("{}: {}", path.display(), e)))?;
            let config = Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|e| Error::Kubeconfig(format!("{}: {}", path.display(), e)))?;
            Ok(ClusterCredentials {
                config,
                source: CredentialSource::Kubeconfig(path.to_path_buf()),
            })
        }
        None => {
            let config = Config::from_kubeconfig(&options)
                .await
                .map_err(|e| Error::Kubeconfig(e.to_string()))?;
            Ok(ClusterCredentials {
                config,
                source: CredentialSource::DefaultKubeconfig,
            })
        }
    }
}

fn with_timeouts(mut credentials: ClusterCredentials) -> ClusterCredentials {
    credentials.config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    credentials.config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    credentials
}

/// Client for a local test server, trusting a throwaway root so no system
/// certificate store is needed
#[cfg(test)]
pub(crate) fn test_client(cluster_url: &str) -> kube::Client {
    crate::tls::install_crypto_provider();
    let root = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("root generation should succeed");
    let mut config = Config::new(cluster_url.parse().expect("cluster url should parse"));
    config.root_cert = Some(vec![root.cert.der().to_vec()]);
    kube::Client::try_from(config).expect("client should build")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: test
  cluster:
    server: https://10.0.0.1:6443
    insecure-skip-tls-verify: true
contexts:
- name: test
  context:
    cluster: test
    user: test
    namespace: apps
current-context: test
users:
- name: test
  user:
    token: test-token
"#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[tokio::test]
    async fn test_explicit_kubeconfig_is_used() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file should be created");
        file.write_all(KUBECONFIG.as_bytes())
            .expect("kubeconfig should be written");

        let credentials = resolve_with(Some(file.path()), env(&[]))
            .await
            .expect("kubeconfig should resolve");

        assert_eq!(
            credentials.source,
            CredentialSource::Kubeconfig(file.path().to_path_buf())
        );
        assert_eq!(credentials.config.cluster_url.host(), Some("10.0.0.1"));
        assert_eq!(credentials.config.cluster_url.port_u16(), Some(6443));
        assert_eq!(credentials.config.default_namespace, "apps");
        assert_eq!(credentials.config.connect_timeout, Some(DEFAULT_CONNECT_TIMEOUT));
        assert_eq!(credentials.config.read_timeout, Some(DEFAULT_READ_TIMEOUT));
    }

    #[tokio::test]
    async fn test_missing_kubeconfig_outside_cluster_is_fatal() {
        let result = resolve_with(
            Some(Path::new("/nonexistent/replica-gate/kubeconfig")),
            env(&[]),
        )
        .await;

        match result {
            Err(Error::NotInCluster { kubeconfig_error }) => {
                assert!(kubeconfig_error.contains("/nonexistent/replica-gate/kubeconfig"));
            }
            Err(other) => panic!("expected NotInCluster, got {other}"),
            Ok(_) => panic!("expected NotInCluster, got credentials"),
        }
    }

    #[tokio::test]
    async fn test_malformed_kubeconfig_with_empty_port_is_not_in_cluster() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file should be created");
        file.write_all(b"this: [is not a kubeconfig")
            .expect("garbage should be written");

        let result = resolve_with(
            Some(file.path()),
            env(&[(SERVICE_HOST_ENV, "10.96.0.1"), (SERVICE_PORT_ENV, "")]),
        )
        .await;

        assert!(matches!(result, Err(Error::NotInCluster { .. })));
    }

    #[tokio::test]
    async fn test_in_cluster_without_service_account_is_in_cluster_error() {
        // Running inside a real pod would make in-cluster config succeed
        if Path::new("/var/run/secrets/kubernetes.io/serviceaccount/token").exists() {
            return;
        }

        let result = resolve_with(
            Some(Path::new("/nonexistent/replica-gate/kubeconfig")),
            env(&[(SERVICE_HOST_ENV, "10.96.0.1"), (SERVICE_PORT_ENV, "443")]),
        )
        .await;

        assert!(matches!(result, Err(Error::InCluster(_))));
    }

    #[test]
    fn test_is_in_cluster_requires_host_and_port() {
        assert!(is_in_cluster(env(&[
            (SERVICE_HOST_ENV, "10.96.0.1"),
            (SERVICE_PORT_ENV, "443"),
        ])));
        assert!(!is_in_cluster(env(&[(SERVICE_HOST_ENV, "10.96.0.1")])));
        assert!(!is_in_cluster(env(&[(SERVICE_PORT_ENV, "443")])));
        assert!(!is_in_cluster(env(&[
            (SERVICE_HOST_ENV, ""),
            (SERVICE_PORT_ENV, "443"),
        ])));
    }

    #[test]
    fn test_credential_source_display() {
        assert_eq!(
            CredentialSource::Kubeconfig(PathBuf::from("/tmp/kc")).to_string(),
            "kubeconfig /tmp/kc"
        );
        assert_eq!(CredentialSource::InCluster.to_string(), "in-cluster service account");
    }
}
