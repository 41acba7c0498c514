//! TLS server context for implicit FTPS and protected data channels.
//!
//! - Builds a rustls `ServerConfig` (ring provider) from PEM material.
//! - Hands out `tokio_rustls::TlsAcceptor`s for control and data sockets.

use crate::ftp::error::{BridgeError, BridgeResult};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Shared server identity. Cheap to clone.
#[derive(Clone)]
pub struct TlsContext {
    config: Arc<ServerConfig>,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext").finish_non_exhaustive()
    }
}

impl TlsContext {
    /// Wrap an already-built rustls configuration.
    pub fn from_config(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }

    /// Build from a PEM certificate chain and a PEM private key
    /// (PKCS#1, PKCS#8 or SEC1).
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> BridgeResult<Self> {
        let certs = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<CertificateDer<'static>>, _>>()
            .map_err(|e| BridgeError::tls_failed(format!("Certificate PEM: {}", e)))?;
        if certs.is_empty() {
            return Err(BridgeError::tls_failed("No certificate found in PEM input"));
        }
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| BridgeError::tls_failed(format!("Private key PEM: {}", e)))?
            .ok_or_else(|| BridgeError::tls_failed("No private key found in PEM input"))?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(Self::from_config(Arc::new(config)))
    }

    pub fn from_pem_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> BridgeResult<Self> {
        let read = |p: &Path| {
            std::fs::read(p)
                .map_err(|e| BridgeError::tls_failed(format!("Reading {}: {}", p.display(), e)))
        };
        let cert = read(cert_path.as_ref())?;
        let key = read(key_path.as_ref())?;
        Self::from_pem(&cert, &key)
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(Arc::clone(&self.config))
    }
}
