//! Command-line configuration
//!
//! Every flag except `--kubeconfig` can also be set through the environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::server::RuntimeConfig;
use crate::{DEFAULT_HEALTH_PORT, DEFAULT_PORT, DEFAULT_SHUTDOWN_TIMEOUT_SECS};

/// replica-gate - mTLS gateway for Deployment replica management
#[derive(Parser, Debug, Clone)]
#[command(name = "replica-gate", version, about, long_about = None)]
pub struct Cli {
    /// Port for the mTLS management listener
    #[arg(long, env = "REPLICA_GATE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Port for the plaintext health listener
    #[arg(long, env = "REPLICA_GATE_HEALTH_PORT", default_value_t = DEFAULT_HEALTH_PORT)]
    pub health_port: u16,

    /// Address both listeners bind to
    #[arg(
        long,
        env = "REPLICA_GATE_BIND_ADDRESS",
        default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    )]
    pub bind_address: IpAddr,

    /// Kubeconfig file; without it kube's default lookup (`KUBECONFIG`, then
    /// `~/.kube/config`) applies, then in-cluster credentials
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// PEM server certificate chain
    #[arg(long, env = "REPLICA_GATE_SERVER_CERT")]
    pub server_cert: PathBuf,

    /// PEM server private key
    #[arg(long, env = "REPLICA_GATE_CERT_KEY")]
    pub cert_key: PathBuf,

    /// PEM bundle of CAs trusted to sign client certificates
    #[arg(long, env = "REPLICA_GATE_CA_CERT")]
    pub ca_cert: PathBuf,

    /// Log verbosity (0-4 info, 5-8 debug, 9+ trace); ignored when RUST_LOG is set
    #[arg(short = 'v', long, env = "REPLICA_GATE_VERBOSITY", default_value_t = 0)]
    pub verbosity: u8,

    /// Seconds open connections may drain during shutdown
    #[arg(
        long,
        env = "REPLICA_GATE_SHUTDOWN_TIMEOUT_SECS",
        default_value_t = DEFAULT_SHUTDOWN_TIMEOUT_SECS
    )]
    pub shutdown_timeout_secs: u64,
}

impl Cli {
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            management_addr: SocketAddr::new(self.bind_address, self.port),
            health_addr: SocketAddr::new(self.bind_address, self.health_port),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }
}
