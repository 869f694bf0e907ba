//! replica-gate - mTLS gateway for Deployment replica management
//!
//! Exposes a small HTTPS API over a Kubernetes cluster's Deployments:
//! listing them, reading their desired replica count and changing it. Every
//! client must present a certificate signed by a trusted CA. A second,
//! plaintext listener serves only the health check for probes.
//!
//! # Modules
//!
//! - [`credentials`] - Kubeconfig / in-cluster credential fallback chain
//! - [`tls`] - mTLS server configuration from PEM files
//! - [`store`] - Reflector-backed Deployment store and its sync loop
//! - [`health`] - `/healthz` proxied to the API server
//! - [`deployments`] - Deployment list and replica endpoints
//! - [`server`] - Dual-listener runtime with graceful shutdown
//! - [`config`] - Command-line and environment configuration
//! - [`telemetry`] - JSON structured logging
//! - [`error`] - Error types for startup and runtime failures

pub mod config;
pub mod credentials;
pub mod deployments;
pub mod error;
pub mod health;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod tls;

pub use error::{Error, Result};

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default port for the mTLS management listener
pub const DEFAULT_PORT: u16 = 8443;

/// Default port for the plaintext health listener
pub const DEFAULT_HEALTH_PORT: u16 = 8080;

/// Default seconds open connections may drain during shutdown
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;
