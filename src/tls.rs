//! mTLS configuration for the management listener
//!
//! Loads the server certificate, private key and client CA bundle from disk
//! and builds a rustls server configuration that:
//! - presents the server certificate
//! - requires every client to present a certificate
//! - verifies that certificate against the CA bundle
//! - refuses anything below TLS 1.3
//!
//! Material is loaded once at startup. Rotating certificates requires a
//! restart.

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Server-side TLS material for the management listener
pub struct TlsMaterial {
    /// Server certificate chain (leaf first)
    cert_chain: Vec<CertificateDer<'static>>,
    /// Server private key
    key: PrivateKeyDer<'static>,
    /// CA certificates trusted for client authentication
    client_roots: Vec<CertificateDer<'static>>,
}

impl TlsMaterial {
    /// Load certificate, key and CA bundle from PEM files
    pub fn load(cert_path: &Path, key_path: &Path, ca_path: &Path) -> Result<Self> {
        let cert_pem = read(cert_path)?;
        let key_pem = Zeroizing::new(read(key_path)?);
        let ca_pem = read(ca_path)?;

        Self::from_pem(&cert_pem, &key_pem, &ca_pem).map_err(|e| match e {
            PemError::NoCertificates => {
                Error::tls(format!("no valid certificates found in {:?}", cert_path))
            }
            PemError::NoPrivateKey => {
                Error::tls(format!("no private key found in {:?}", key_path))
            }
            PemError::NoCaCertificates => {
                Error::tls(format!("no valid CA certificates found in {:?}", ca_path))
            }
            PemError::Parse(msg) => Error::tls(msg),
        })
    }

    fn from_pem(
        cert_pem: &[u8],
        key_pem: &[u8],
        ca_pem: &[u8],
    ) -> std::result::Result<Self, PemError> {
        let cert_chain = parse_certs(cert_pem)?;
        if cert_chain.is_empty() {
            return Err(PemError::NoCertificates);
        }

        let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
            .map_err(|e| PemError::Parse(format!("failed to parse private key: {}", e)))?
            .ok_or(PemError::NoPrivateKey)?;

        let client_roots = parse_certs(ca_pem)?;
        if client_roots.is_empty() {
            return Err(PemError::NoCaCertificates);
        }

        Ok(Self {
            cert_chain,
            key,
            client_roots,
        })
    }

    /// Number of CA certificates trusted for client authentication
    pub fn client_ca_count(&self) -> usize {
        self.client_roots.len()
    }

    /// Build the rustls server configuration
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let verifier = self.client_verifier(provider.clone())?;

        let mut config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| Error::tls(format!("unsupported protocol versions: {}", e)))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())
            .map_err(|e| Error::tls(format!("invalid server certificate or key: {}", e)))?;

        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        debug!(
            chain_len = self.cert_chain.len(),
            client_cas = self.client_roots.len(),
            "Built mTLS server config"
        );

        Ok(Arc::new(config))
    }

    /// Client certificate verifier backed by the CA bundle
    ///
    /// Client authentication is mandatory; revocation is not checked.
    fn client_verifier(
        &self,
        provider: Arc<CryptoProvider>,
    ) -> Result<Arc<dyn ClientCertVerifier>> {
        let mut roots = RootCertStore::empty();
        for cert in &self.client_roots {
            roots
                .add(cert.clone())
                .map_err(|e| Error::tls(format!("invalid CA certificate: {}", e)))?;
        }

        WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| Error::tls(format!("failed to build client verifier: {}", e)))
    }
}

/// Install the process-wide rustls crypto provider (aws-lc-rs)
///
/// Returns false if another provider was already installed, which is fine
/// for tests that call this repeatedly.
pub fn install_crypto_provider() -> bool {
    CryptoProvider::get_default().is_none()
        && rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .is_ok()
}

enum PemError {
    NoCertificates,
    NoPrivateKey,
    NoCaCertificates,
    Parse(String),
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|source| Error::Io {
        path: PathBuf::from(path),
        source,
    })
}

fn parse_certs(pem: &[u8]) -> std::result::Result<Vec<CertificateDer<'static>>, PemError> {
    rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| PemError::Parse(format!("failed to parse certificate: {}", e)))
}
