//! Transport security for both ends of a connection.
//!
//! A [`SecurityContext`] turns a [`SecurityMode`] into the credential each
//! side needs: [`ServerCredentials`] wrap accepted sockets and
//! [`ClientCredentials`] wrap dialed ones. Plaintext, server-authenticated
//! TLS and mutual TLS all share the same server and client code; only the
//! credential value differs.

use crate::config::{SecurityMode, TlsFiles};
use crate::{Error, Result};
use log::debug;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// A byte stream the protocol can run over, secured or not.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Type-erased connection handed to the streamer and the consumer.
pub type BoxedTransport = Box<dyn Transport>;

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| Error::Credential(format!("Failed to read {}: {}", path.display(), e)))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Credential(format!("Failed to parse {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::Credential(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    debug!("Loaded {} certificate(s) from {}", certs.len(), path.display());
    Ok(certs)
}

// Errors name the file only; key bytes never reach a message or a log.
fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_file(path).map_err(|e| {
        Error::Credential(format!(
            "Failed to load private key from {}: {}",
            path.display(),
            e
        ))
    })
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert).map_err(|e| {
            Error::Credential(format!("Invalid CA certificate in {}: {}", path.display(), e))
        })?;
    }
    Ok(roots)
}

/// The TLS failure inside an io error when it means the peer refused the
/// handshake. A TLS 1.3 client only learns that its certificate was
/// rejected when it next reads, after `connect` already succeeded.
pub(crate) fn rejected_handshake(err: &std::io::Error) -> Option<&rustls::Error> {
    let tls = err.get_ref()?.downcast_ref::<rustls::Error>()?;
    match tls {
        rustls::Error::AlertReceived(_)
        | rustls::Error::InvalidCertificate(_)
        | rustls::Error::NoCertificatesPresented => Some(tls),
        _ => None,
    }
}

fn server_name(name: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(name.to_string())
        .map_err(|e| Error::Credential(format!("Invalid server name {:?}: {}", name, e)))
}

/// Listening-side credential.
#[derive(Clone)]
pub struct ServerCredentials {
    acceptor: Option<TlsAcceptor>,
}

impl ServerCredentials {
    /// No transport security.
    pub fn plaintext() -> Self {
        Self { acceptor: None }
    }

    pub fn is_secure(&self) -> bool {
        self.acceptor.is_some()
    }

    /// Runs the server side of the handshake on an accepted socket.
    pub async fn accept(&self, stream: TcpStream) -> Result<BoxedTransport> {
        match &self.acceptor {
            None => Ok(Box::new(stream)),
            Some(acceptor) => {
                let tls = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| Error::Handshake(e.to_string()))?;
                Ok(Box::new(tls))
            }
        }
    }
}

/// Dialing-side credential.
#[derive(Clone)]
pub struct ClientCredentials {
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl ClientCredentials {
    /// No transport security.
    pub fn plaintext() -> Self {
        Self { tls: None }
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    /// Runs the client side of the handshake on a connected socket.
    pub async fn connect(&self, stream: TcpStream) -> Result<BoxedTransport> {
        match &self.tls {
            None => Ok(Box::new(stream)),
            Some((connector, name)) => {
                let tls = connector
                    .connect(name.clone(), stream)
                    .await
                    .map_err(|e| Error::Handshake(e.to_string()))?;
                Ok(Box::new(tls))
            }
        }
    }
}

/// Resolves a [`SecurityMode`] into per-side credentials.
///
/// Only file reads happen here; a missing, unreadable or unparsable file
/// yields [`Error::Credential`].
///
/// # Examples
///
/// ```
/// use streamperf::{SecurityContext, SecurityMode};
///
/// let context = SecurityContext::new(SecurityMode::Plaintext);
/// assert!(!context.server_credentials().unwrap().is_secure());
/// assert!(!context.client_credentials().unwrap().is_secure());
/// ```
#[derive(Debug, Clone)]
pub struct SecurityContext {
    mode: SecurityMode,
}

impl SecurityContext {
    pub fn new(mode: SecurityMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> &SecurityMode {
        &self.mode
    }

    /// Builds the credential used when listening.
    ///
    /// Server TLS presents `cert`/`key`. Mutual TLS additionally requires
    /// every client to present a certificate chaining to `ca`.
    pub fn server_credentials(&self) -> Result<ServerCredentials> {
        let (files, verify_clients) = match &self.mode {
            SecurityMode::Plaintext => return Ok(ServerCredentials::plaintext()),
            SecurityMode::ServerTls(files) => (files, false),
            SecurityMode::MutualTls(files) => (files, true),
        };

        let certs = load_certs(&files.cert)?;
        let key = load_key(&files.key)?;
        let builder = rustls::ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Credential(e.to_string()))?;

        let builder = if verify_clients {
            let roots = load_roots(&files.ca)?;
            let verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::new(roots), crypto_provider())
                    .build()
                    .map_err(|e| Error::Credential(format!("Client verifier: {}", e)))?;
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };

        let config = builder
            .with_single_cert(certs, key)
            .map_err(|e| Error::Credential(format!("Server certificate: {}", e)))?;

        Ok(ServerCredentials {
            acceptor: Some(TlsAcceptor::from(Arc::new(config))),
        })
    }

    /// Builds the credential used when dialing.
    ///
    /// Both TLS modes trust `ca` and verify the server against
    /// `server_name`; mutual TLS additionally presents `cert`/`key`.
    pub fn client_credentials(&self) -> Result<ClientCredentials> {
        let (files, present_cert) = match &self.mode {
            SecurityMode::Plaintext => return Ok(ClientCredentials::plaintext()),
            SecurityMode::ServerTls(files) => (files, false),
            SecurityMode::MutualTls(files) => (files, true),
        };

        let name = server_name(&files.server_name)?;
        let roots = load_roots(&files.ca)?;
        let builder = rustls::ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Credential(e.to_string()))?
            .with_root_certificates(roots);

        let config = if present_cert {
            let (certs, key) = load_identity(files)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| Error::Credential(format!("Client certificate: {}", e)))?
        } else {
            builder.with_no_client_auth()
        };

        Ok(ClientCredentials {
            tls: Some((TlsConnector::from(Arc::new(config)), name)),
        })
    }
}

fn load_identity(
    files: &TlsFiles,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    Ok((load_certs(&files.cert)?, load_key(&files.key)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn missing_files(dir: &Path) -> TlsFiles {
        TlsFiles::server_defaults()
            .with_cert(dir.join("nope_cert.pem"))
            .with_key(dir.join("nope_key.pem"))
            .with_ca(dir.join("nope_ca.pem"))
    }

    #[test]
    fn test_plaintext_credentials() {
        let context = SecurityContext::new(SecurityMode::Plaintext);
        assert!(!context.server_credentials().unwrap().is_secure());
        assert!(!context.client_credentials().unwrap().is_secure());
    }

    #[test]
    fn test_missing_cert_is_credential_error() {
        let dir = tempfile::tempdir().unwrap();
        let context = SecurityContext::new(SecurityMode::ServerTls(missing_files(dir.path())));
        assert!(matches!(context.server_credentials(), Err(Error::Credential(_))));
        assert!(matches!(context.client_credentials(), Err(Error::Credential(_))));
    }

    #[test]
    fn test_garbage_pem_is_credential_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.pem");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "this is not a certificate").unwrap();

        let files = missing_files(dir.path()).with_cert(&path).with_ca(&path);
        let context = SecurityContext::new(SecurityMode::MutualTls(files));
        assert!(matches!(context.server_credentials(), Err(Error::Credential(_))));
        assert!(matches!(context.client_credentials(), Err(Error::Credential(_))));
    }

    #[test]
    fn test_invalid_server_name() {
        let dir = tempfile::tempdir().unwrap();
        let files = missing_files(dir.path()).with_server_name("not a host name!");
        let context = SecurityContext::new(SecurityMode::ServerTls(files));
        match context.client_credentials() {
            Err(Error::Credential(msg)) => assert!(msg.contains("server name")),
            Err(other) => panic!("Unexpected error: {}", other),
            Ok(_) => panic!("Expected credential error"),
        }
    }
}
