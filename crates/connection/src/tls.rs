//! Pluggable secure transport.
//!
//! The connection layer only needs "turn this TCP stream into an encrypted
//! byte stream". The rustls-backed connector verifies certificates against
//! the bundled web PKI roots. There is no accept-any-certificate mode.

use std::fs::File;
use std::future::Future;
use std::io::{self, BufReader};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, RootCertStore};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::stream::BoxedStream;

pub type SecureFuture<'a> = Pin<Box<dyn Future<Output = io::Result<BoxedStream>> + Send + 'a>>;

/// Client side: wraps an established TCP stream in an encrypted session.
pub trait SecureStreamProvider: Send + Sync {
    fn establish<'a>(&'a self, stream: TcpStream, host: &'a str) -> SecureFuture<'a>;
}

/// Server side: completes the TLS handshake on an accepted TCP stream.
pub trait SecureAcceptor: Send + Sync {
    fn accept(&self, stream: TcpStream) -> SecureFuture<'_>;
}

/// rustls client that trusts the Mozilla root set from `webpki-roots`.
#[derive(Clone)]
pub struct RustlsConnector {
    connector: TlsConnector,
}

impl RustlsConnector {
    pub fn new(config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            connector: TlsConnector::from(config),
        }
    }

    pub fn with_webpki_roots() -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self::new(Arc::new(config))
    }
}

impl Default for RustlsConnector {
    fn default() -> Self {
        Self::with_webpki_roots()
    }
}

impl SecureStreamProvider for RustlsConnector {
    fn establish<'a>(&'a self, stream: TcpStream, host: &'a str) -> SecureFuture<'a> {
        Box::pin(async move {
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let tls = self.connector.connect(server_name, stream).await?;
            debug!(host, "TLS session established");
            Ok(Box::new(tls) as BoxedStream)
        })
    }
}

/// rustls server with a single certificate chain.
#[derive(Clone)]
pub struct RustlsAcceptor {
    acceptor: TlsAcceptor,
}

impl RustlsAcceptor {
    pub fn new(config: Arc<rustls::ServerConfig>) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
        }
    }

    /// Loads a PEM certificate chain and private key from disk.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> io::Result<Self> {
        let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("no certificates in {}", cert_path.display()),
            ));
        }

        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("no private key in {}", key_path.display()),
                )
            })?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Self::new(Arc::new(config)))
    }
}

impl SecureAcceptor for RustlsAcceptor {
    fn accept(&self, stream: TcpStream) -> SecureFuture<'_> {
        Box::pin(async move {
            let tls = self.acceptor.accept(stream).await?;
            Ok(Box::new(tls) as BoxedStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn connector_builds_with_bundled_roots() {
        let _ = RustlsConnector::default();
    }

    #[test]
    fn missing_pem_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.pem");
        assert!(RustlsAcceptor::from_pem_files(&missing, &missing).is_err());
    }

    #[test]
    fn empty_certificate_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        File::create(&cert).unwrap();
        File::create(&key).unwrap().write_all(b"").unwrap();

        let err = RustlsAcceptor::from_pem_files(&cert, &key).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
