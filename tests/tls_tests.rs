mod common;

use common::{local_config, TestPki, TestServer};
use std::time::Duration;
use streamperf::source::{BlobSource, Dataset};
use streamperf::{Client, ClientConfig, Error, SecurityMode, Server, ServerConfig};

fn payload() -> Dataset {
    Dataset::Blob(BlobSource::from_vec(vec![0x5A; 100_000]))
}

/// A rejected client certificate surfaces either while dialing or, under
/// TLS 1.3, on the first read of sample 1.
fn is_handshake_failure(err: &Error) -> bool {
    match err {
        Error::Handshake(_) => true,
        Error::Sample { index: 1, source } => matches!(**source, Error::Handshake(_)),
        _ => false,
    }
}

async fn tls_server(pki: &TestPki, mode: fn(streamperf::TlsFiles) -> SecurityMode) -> TestServer {
    let config = local_config()
        .with_chunk_size(8192)
        .with_security(mode(pki.server_files()));
    TestServer::start(config, payload()).await
}

#[tokio::test]
async fn test_server_tls_roundtrip() {
    let pki = TestPki::generate();
    let server = tls_server(&pki, SecurityMode::ServerTls).await;

    let config = server
        .client_config()
        .with_samples(3)
        .with_security(SecurityMode::ServerTls(pki.client_files()));
    let report = Client::new(config).unwrap().run().await.unwrap();

    assert_eq!(report.security, "tls");
    assert_eq!(report.samples.len(), 3);
    assert!(report.samples.iter().all(|s| s.total_bytes == 100_000));
    assert!(report.samples.iter().all(|s| s.chunk_count == 13));
}

#[tokio::test]
async fn test_server_tls_fresh_connections() {
    let pki = TestPki::generate();
    let server = tls_server(&pki, SecurityMode::ServerTls).await;

    let config = server
        .client_config()
        .with_samples(2)
        .with_reuse_connection(false)
        .with_security(SecurityMode::ServerTls(pki.client_files()));
    let report = Client::new(config).unwrap().run().await.unwrap();
    assert_eq!(report.samples.len(), 2);

    let stats = server.wait_for_stats(|s| s.transfers_completed == 2).await;
    assert_eq!(stats.connections, 2);
}

#[tokio::test]
async fn test_server_tls_untrusted_ca_fails() {
    let pki = TestPki::generate();
    let server = tls_server(&pki, SecurityMode::ServerTls).await;

    let files = pki.client_files().with_ca(pki.path("rogue_ca_cert.pem"));
    let config = server
        .client_config()
        .with_security(SecurityMode::ServerTls(files));
    let result = Client::new(config).unwrap().run().await;

    assert!(matches!(result, Err(Error::Handshake(_))));
    assert_eq!(server.server.stats().bytes_sent, 0);
}

#[tokio::test]
async fn test_server_tls_wrong_server_name_fails() {
    let pki = TestPki::generate();
    let server = tls_server(&pki, SecurityMode::ServerTls).await;

    let files = pki.client_files().with_server_name("other.example.com");
    let config = server
        .client_config()
        .with_security(SecurityMode::ServerTls(files));
    let result = Client::new(config).unwrap().run().await;

    assert!(matches!(result, Err(Error::Handshake(_))));
}

#[tokio::test]
async fn test_plaintext_client_against_tls_server_fails() {
    let pki = TestPki::generate();
    let server = tls_server(&pki, SecurityMode::ServerTls).await;

    let config = server
        .client_config()
        .with_read_timeout(Duration::from_secs(5));
    let result = Client::new(config).unwrap().run().await;

    assert!(result.is_err());
    assert_eq!(server.server.stats().bytes_sent, 0);
}

#[tokio::test]
async fn test_mutual_tls_roundtrip() {
    let pki = TestPki::generate();
    let server = tls_server(&pki, SecurityMode::MutualTls).await;

    let config = server
        .client_config()
        .with_samples(2)
        .with_security(SecurityMode::MutualTls(pki.client_files()));
    let report = Client::new(config).unwrap().run().await.unwrap();

    assert_eq!(report.security, "mtls");
    assert!(report.samples.iter().all(|s| s.total_bytes == 100_000));

    let stats = server.wait_for_stats(|s| s.transfers_completed == 2).await;
    assert_eq!(stats.handshake_failures, 0);
}

#[tokio::test]
async fn test_mutual_tls_client_without_certificate_rejected() {
    let pki = TestPki::generate();
    let server = tls_server(&pki, SecurityMode::MutualTls).await;

    // Trusts the server but presents nothing.
    let config = server
        .client_config()
        .with_read_timeout(Duration::from_secs(5))
        .with_security(SecurityMode::ServerTls(pki.client_files()));
    match Client::new(config).unwrap().run().await {
        Err(e) => assert!(is_handshake_failure(&e), "Expected handshake failure, got {}", e),
        Ok(_) => panic!("Expected the server to reject the client"),
    }

    let stats = server.wait_for_stats(|s| s.handshake_failures == 1).await;
    assert_eq!(stats.transfers_completed, 0);
    assert_eq!(stats.bytes_sent, 0);
}

#[tokio::test]
async fn test_mutual_tls_untrusted_client_certificate_rejected() {
    let pki = TestPki::generate();
    let server = tls_server(&pki, SecurityMode::MutualTls).await;

    let config = server
        .client_config()
        .with_read_timeout(Duration::from_secs(5))
        .with_security(SecurityMode::MutualTls(pki.rogue_client_files()));
    match Client::new(config).unwrap().run().await {
        Err(e) => assert!(is_handshake_failure(&e), "Expected handshake failure, got {}", e),
        Ok(_) => panic!("Expected the server to reject the client"),
    }

    let stats = server.wait_for_stats(|s| s.handshake_failures == 1).await;
    assert_eq!(stats.transfers_completed, 0);
    assert_eq!(stats.bytes_sent, 0);
}

#[test]
fn test_missing_credentials_fail_at_startup() {
    let pki = TestPki::generate();
    let files = pki.server_files().with_cert(pki.path("does_not_exist.pem"));

    let config = ServerConfig::new(0).with_security(SecurityMode::ServerTls(files.clone()));
    let dataset = payload();
    assert!(matches!(Server::new(config, dataset), Err(Error::Credential(_))));

    let config = ClientConfig::new("127.0.0.1:5000").with_security(SecurityMode::MutualTls(files));
    assert!(matches!(Client::new(config), Err(Error::Credential(_))));
}

#[test]
fn test_mutual_tls_server_requires_client_ca() {
    let pki = TestPki::generate();
    let files = pki.server_files().with_ca(pki.path("missing_ca.pem"));

    // Server TLS never reads the CA bundle; mutual TLS must.
    let config = ServerConfig::new(0).with_security(SecurityMode::ServerTls(files.clone()));
    assert!(Server::new(config, payload()).is_ok());

    let config = ServerConfig::new(0).with_security(SecurityMode::MutualTls(files));
    assert!(matches!(Server::new(config, payload()), Err(Error::Credential(_))));
}
