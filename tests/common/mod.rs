// Shared helpers for the integration tests: a loopback server harness and
// a throwaway certificate authority.
#![allow(dead_code)]

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use streamperf::config::DEFAULT_SERVER_NAME;
use streamperf::source::Dataset;
use streamperf::{ClientConfig, Server, ServerConfig, ServerStats, TlsFiles};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Server configuration bound to an ephemeral loopback port.
pub fn local_config() -> ServerConfig {
    ServerConfig::new(0).with_bind_addr("127.0.0.1".parse().unwrap())
}

/// A running server that shuts down when dropped.
pub struct TestServer {
    pub addr: SocketAddr,
    pub server: Server,
    shutdown: CancellationToken,
}

impl TestServer {
    pub async fn start(config: ServerConfig, dataset: Dataset) -> Self {
        let server = Server::new(config, dataset).unwrap();
        let listener = server.listen().await.unwrap();
        let addr = listener.local_addr().unwrap();

        let shutdown = CancellationToken::new();
        let task_server = server.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { task_server.serve(listener, token).await });

        Self {
            addr,
            server,
            shutdown,
        }
    }

    /// Client configuration pointed at this server, printing nothing.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new(self.addr.to_string()).with_json(true)
    }

    /// Waits until the server's statistics satisfy `done`.
    ///
    /// Connection tasks record their totals after the last frame is
    /// flushed, so a client can finish before the server has counted it.
    pub async fn wait_for_stats(&self, done: impl Fn(&ServerStats) -> bool) -> ServerStats {
        for _ in 0..500 {
            let stats = self.server.stats();
            if done(&stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server stats never settled: {:?}", self.server.stats());
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Accepts connections on a loopback port and hands each one to `handler`.
///
/// Used to stand in for a misbehaving server.
pub async fn raw_server<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(handler(stream));
        }
    });
    addr
}

fn ca(name: &str) -> (Certificate, KeyPair) {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::CrlSign,
    ];
    params.distinguished_name.push(DnType::CommonName, name);
    let cert = params.self_signed(&key).unwrap();
    (cert, key)
}

fn leaf(issuer: &Certificate, issuer_key: &KeyPair, name: &str) -> (Certificate, KeyPair) {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
    params.distinguished_name.push(DnType::CommonName, name);
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    let cert = params.signed_by(&key, issuer, issuer_key).unwrap();
    (cert, key)
}

/// Two unrelated CAs with leaf certificates, written as PEM files.
///
/// The trusted CA signs the server and client certificates; the rogue CA
/// signs a client certificate nobody should accept.
pub struct TestPki {
    dir: TempDir,
}

impl TestPki {
    pub fn generate() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let write = |name: &str, contents: String| {
            std::fs::write(dir.path().join(name), contents).unwrap();
        };

        let (ca_cert, ca_key) = ca("streamperf test CA");
        let (server_cert, server_key) = leaf(&ca_cert, &ca_key, DEFAULT_SERVER_NAME);
        let (client_cert, client_key) = leaf(&ca_cert, &ca_key, "client.test.example.com");

        let (rogue_cert, rogue_key) = ca("rogue CA");
        let (rogue_client_cert, rogue_client_key) =
            leaf(&rogue_cert, &rogue_key, "client.test.example.com");

        write("ca_cert.pem", ca_cert.pem());
        write("server_cert.pem", server_cert.pem());
        write("server_key.pem", server_key.serialize_pem());
        write("client_cert.pem", client_cert.pem());
        write("client_key.pem", client_key.serialize_pem());
        write("rogue_ca_cert.pem", rogue_cert.pem());
        write("rogue_client_cert.pem", rogue_client_cert.pem());
        write("rogue_client_key.pem", rogue_client_key.serialize_pem());

        Self { dir }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Server identity; client certificates must chain to the trusted CA.
    pub fn server_files(&self) -> TlsFiles {
        TlsFiles::server_defaults()
            .with_cert(self.path("server_cert.pem"))
            .with_key(self.path("server_key.pem"))
            .with_ca(self.path("ca_cert.pem"))
    }

    /// Client identity signed by the trusted CA, trusting the same CA.
    pub fn client_files(&self) -> TlsFiles {
        TlsFiles::client_defaults()
            .with_cert(self.path("client_cert.pem"))
            .with_key(self.path("client_key.pem"))
            .with_ca(self.path("ca_cert.pem"))
    }

    /// Client identity signed by the rogue CA.
    pub fn rogue_client_files(&self) -> TlsFiles {
        self.client_files()
            .with_cert(self.path("rogue_client_cert.pem"))
            .with_key(self.path("rogue_client_key.pem"))
    }
}
