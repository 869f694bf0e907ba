//! Dual-listener runtime
//!
//! Runs three supervised tasks on one cancellation token:
//! - the mTLS management server with every route
//! - the plaintext health server with only `/healthz`
//! - the object-store sync
//!
//! Cancelling the token, or any task exiting, starts a graceful shutdown of
//! both servers. [`BoundRuntime::serve`] returns once all three have stopped.

use std::fmt;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::deployments;
use crate::error::{Error, Result};
use crate::health::{self, HealthProbe};
use crate::store::{DeploymentStore, ObjectStoreSync};

/// Lifecycle of a [`Runtime`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimePhase {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for RuntimePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimePhase::Starting => write!(f, "starting"),
            RuntimePhase::Running => write!(f, "running"),
            RuntimePhase::ShuttingDown => write!(f, "shutting down"),
            RuntimePhase::Stopped => write!(f, "stopped"),
        }
    }
}

/// Listener addresses and shutdown grace period
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// mTLS management listener
    pub management_addr: SocketAddr,
    /// Plaintext health listener
    pub health_addr: SocketAddr,
    /// How long open connections may drain after shutdown starts
    pub shutdown_timeout: Duration,
}

/// Everything the runtime serves, before any socket is bound
pub struct Runtime<S> {
    config: RuntimeConfig,
    tls: Arc<rustls::ServerConfig>,
    store: Arc<dyn DeploymentStore>,
    probe: Arc<dyn HealthProbe>,
    sync: S,
}

/// A [`Runtime`] whose listeners are bound and ready to serve
pub struct BoundRuntime<S> {
    management: TcpListener,
    health: TcpListener,
    management_addr: SocketAddr,
    health_addr: SocketAddr,
    shutdown_timeout: Duration,
    tls: Arc<rustls::ServerConfig>,
    store: Arc<dyn DeploymentStore>,
    probe: Arc<dyn HealthProbe>,
    sync: S,
    phase: watch::Sender<RuntimePhase>,
}

impl<S: ObjectStoreSync> Runtime<S> {
    pub fn new(
        config: RuntimeConfig,
        tls: Arc<rustls::ServerConfig>,
        store: Arc<dyn DeploymentStore>,
        probe: Arc<dyn HealthProbe>,
        sync: S,
    ) -> Self {
        Self {
            config,
            tls,
            store,
            probe,
            sync,
        }
    }

    /// Bind both listeners
    ///
    /// Nothing is served yet; a bind failure here is fatal.
    pub fn bind(self) -> Result<BoundRuntime<S>> {
        let (phase, _) = watch::channel(RuntimePhase::Starting);
        info!(phase = %RuntimePhase::Starting, "Runtime phase changed");

        let management = bind(self.config.management_addr)?;
        let health = bind(self.config.health_addr)?;
        let management_addr = local_addr(&management, self.config.management_addr)?;
        let health_addr = local_addr(&health, self.config.health_addr)?;

        Ok(BoundRuntime {
            management,
            health,
            management_addr,
            health_addr,
            shutdown_timeout: self.config.shutdown_timeout,
            tls: self.tls,
            store: self.store,
            probe: self.probe,
            sync: self.sync,
            phase,
        })
    }
}

impl<S: ObjectStoreSync> BoundRuntime<S> {
    /// Bound address of the mTLS management listener
    pub fn management_addr(&self) -> SocketAddr {
        self.management_addr
    }

    /// Bound address of the plaintext health listener
    pub fn health_addr(&self) -> SocketAddr {
        self.health_addr
    }

    /// Watch phase transitions
    pub fn phase(&self) -> watch::Receiver<RuntimePhase> {
        self.phase.subscribe()
    }

    /// Serve until `shutdown` is cancelled or a task exits
    ///
    /// Returns the first error any task reported.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let management_router = management_router(self.store, self.probe.clone());
        let health_router = health_router(self.probe);
        let management_handle = Handle::new();
        let health_handle = Handle::new();

        let mut tasks = JoinSet::new();

        info!(addr = %self.management_addr, "Starting mTLS management server");
        let server = axum_server::from_tcp_rustls(
            self.management,
            RustlsConfig::from_config(self.tls),
        )
        .handle(management_handle.clone());
        tasks.spawn(supervise("management server", shutdown.clone(), async move {
            server
                .serve(management_router.into_make_service())
                .await
                .map_err(|e| Error::task("management server", e.to_string()))
        }));

        info!(addr = %self.health_addr, "Starting health server");
        let server = axum_server::from_tcp(self.health).handle(health_handle.clone());
        tasks.spawn(supervise("health server", shutdown.clone(), async move {
            server
                .serve(health_router.into_make_service())
                .await
                .map_err(|e| Error::task("health server", e.to_string()))
        }));

        tasks.spawn(supervise(
            "object store sync",
            shutdown.clone(),
            self.sync.run(shutdown.clone()),
        ));

        set_phase(&self.phase, RuntimePhase::Running);

        shutdown.cancelled().await;
        set_phase(&self.phase, RuntimePhase::ShuttingDown);
        management_handle.graceful_shutdown(Some(self.shutdown_timeout));
        health_handle.graceful_shutdown(Some(self.shutdown_timeout));

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| Error::task("runtime task", e.to_string()));
            if let Err(e) = result.and_then(|r| r) {
                first_error.get_or_insert(e);
            }
        }

        set_phase(&self.phase, RuntimePhase::Stopped);
        first_error.map_or(Ok(()), Err)
    }
}

/// Management router: deployment routes and `/healthz`
pub fn management_router(
    store: Arc<dyn DeploymentStore>,
    probe: Arc<dyn HealthProbe>,
) -> Router {
    deployments::router(store)
        .merge(health::router(probe))
        .layer(middleware::from_fn(log_request))
}

/// Health-only router; every other path is a 404
pub fn health_router(probe: Arc<dyn HealthProbe>) -> Router {
    health::router(probe).layer(middleware::from_fn(log_request))
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();
    debug!(method = %method, path = %path, "Request started");

    let response = next.run(request).await;

    debug!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        "Request completed"
    );
    response
}

/// Run a task and cancel `shutdown` when it exits for any reason
async fn supervise<F>(name: &'static str, shutdown: CancellationToken, task: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    let result = task.await;
    match &result {
        Ok(()) => info!(task = name, "Task exited"),
        Err(e) => error!(task = name, error = %e, "Task failed, shutting down"),
    }
    shutdown.cancel();
    result
}

fn set_phase(phase: &watch::Sender<RuntimePhase>, next: RuntimePhase) {
    let previous = phase.send_replace(next);
    info!(from = %previous, to = %next, "Runtime phase changed");
}

fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).map_err(|source| Error::Bind { addr, source })?;
    listener
        .set_nonblocking(true)
        .map_err(|source| Error::Bind { addr, source })?;
    Ok(listener)
}

fn local_addr(listener: &TcpListener, requested: SocketAddr) -> Result<SocketAddr> {
    listener.local_addr().map_err(|source| Error::Bind {
        addr: requested,
        source,
    })
}

/// Resolve once SIGINT or SIGTERM is received
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}
