//! replica-gate - mTLS gateway for Deployment replica management

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use replica_gate::config::Cli;
use replica_gate::credentials;
use replica_gate::health::KubeHealthProbe;
use replica_gate::server::{shutdown_signal, Runtime};
use replica_gate::store::CachedDeploymentStore;
use replica_gate::telemetry::init_telemetry;
use replica_gate::tls::{install_crypto_provider, TlsMaterial};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider before any TLS or kube client is built
    if !install_crypto_provider() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider");
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_telemetry(cli.verbosity)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting replica-gate");

    let credentials = credentials::resolve(cli.kubeconfig.as_deref()).await?;
    let client = credentials.client()?;
    info!(source = %credentials.source, cluster = %credentials.config.cluster_url, "Connected to cluster");

    let tls = TlsMaterial::load(&cli.server_cert, &cli.cert_key, &cli.ca_cert)
        .context("failed to load mTLS material")?;
    info!(client_cas = tls.client_ca_count(), "Loaded mTLS material");
    let tls_config = tls.server_config()?;

    let (store, sync) = CachedDeploymentStore::new(client.clone());
    let runtime = Runtime::new(
        cli.runtime_config(),
        tls_config,
        Arc::new(store),
        Arc::new(KubeHealthProbe::new(client)),
        sync,
    )
    .bind()?;

    info!(
        management = %runtime.management_addr(),
        health = %runtime.health_addr(),
        "Listeners bound"
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    runtime.serve(shutdown).await?;
    info!("replica-gate stopped");
    Ok(())
}
