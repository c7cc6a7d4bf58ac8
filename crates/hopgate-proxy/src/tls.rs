//! TLS material for the listener and for `https://` forward targets.
//!
//! The listener only ever advertises `http/1.1` over ALPN: CONNECT upgrade
//! handling assumes HTTP/1.1 semantics, so HTTP/2 must never be negotiated.
//! Both configs use the ring provider explicitly to avoid ambiguity when
//! multiple crypto providers are in the dependency tree.

use crate::error::{ProxyError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Load a PEM certificate chain.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        ProxyError::Tls(format!(
            "failed to open certificate file '{}': {}",
            path.display(),
            e
        ))
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(ProxyError::Tls(format!(
            "no certificates found in '{}'",
            path.display()
        )));
    }

    info!("Loaded {} certificate(s) from {}", certs.len(), path.display());
    Ok(certs)
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        ProxyError::Tls(format!("failed to open key file '{}': {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ProxyError::Tls(format!("failed to parse private key: {}", e)))?
        .ok_or_else(|| {
            ProxyError::Tls(format!("no private key found in '{}'", path.display()))
        })
}

/// Build the listener's TLS acceptor from certificate and key files.
pub fn acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let mut config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(format!("TLS config error: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Tls(format!("TLS config error: {}", e)))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build the shared connector for `https://` forward targets.
///
/// Created once at startup; the root cert store is expensive to construct.
pub fn connector() -> Result<TlsConnector> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(format!("TLS config error: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_cert_file() {
        let err = load_certs(Path::new("/nonexistent/hopgate.pem")).unwrap_err();
        assert!(matches!(err, ProxyError::Tls(_)));
        assert!(err.is_startup_fatal());
    }

    #[test]
    fn test_cert_file_without_certs() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a pem file").unwrap();
        let err = load_certs(file.path()).unwrap_err();
        assert!(err.to_string().contains("no certificates"));
    }

    #[test]
    fn test_key_file_without_key() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "-----BEGIN CERTIFICATE-----").unwrap();
        writeln!(file, "-----END CERTIFICATE-----").unwrap();
        let err = load_private_key(file.path()).unwrap_err();
        assert!(matches!(err, ProxyError::Tls(_)));
    }

    #[test]
    fn test_acceptor_fails_on_missing_files() {
        let result = acceptor(
            Path::new("/nonexistent/server.pem"),
            Path::new("/nonexistent/server.key"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_connector_builds() {
        assert!(connector().is_ok());
    }
}
