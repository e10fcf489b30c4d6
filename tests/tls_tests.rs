//! TLS and mutual TLS integration tests.

use rustls::version::{TLS12, TLS13};
use rustls::ProtocolVersion;

use server_lifecycle::Server;

mod common;

#[tokio::test]
async fn test_tls12_only_client_negotiates_tls12() {
    let server = Server::new(common::demo_app());
    let (addr, _running) = common::spawn_server(&server, common::tls_config(None)).await;

    let connector = common::tls_connector(&[&TLS12], None);
    let response = common::https_get(addr, &connector, "/").await.unwrap();

    assert_eq!(response.version, Some(ProtocolVersion::TLSv1_2));
    assert!(response.is_ok(), "{}", response.raw);
    assert!(response.raw.ends_with("hello"));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_modern_client_negotiates_tls13() {
    let server = Server::new(common::demo_app());
    let (addr, _running) = common::spawn_server(&server, common::tls_config(None)).await;

    let connector = common::tls_connector(&[&TLS13, &TLS12], None);
    let response = common::https_get(addr, &connector, "/").await.unwrap();

    assert_eq!(response.version, Some(ProtocolVersion::TLSv1_3));
    assert!(response.is_ok(), "{}", response.raw);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_plain_client_cannot_reach_tls_listener() {
    let server = Server::new(common::demo_app());
    let (addr, _running) = common::spawn_server(&server, common::tls_config(None)).await;

    assert!(common::get(addr, "/").await.is_err());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_mtls_rejects_client_without_certificate() {
    let server = Server::new(common::demo_app());
    let (addr, _running) = common::spawn_server(&server, common::tls_config(Some("ca.pem"))).await;

    let connector = common::tls_connector(&[&TLS13, &TLS12], None);
    let result = common::https_get(addr, &connector, "/").await;

    assert!(
        !matches!(&result, Ok(response) if response.is_ok()),
        "request without a client certificate reached the app: {result:?}"
    );

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_mtls_rejects_certificate_from_unrelated_ca() {
    let server = Server::new(common::demo_app());
    let (addr, _running) = common::spawn_server(&server, common::tls_config(Some("ca.pem"))).await;

    let connector = common::tls_connector(
        &[&TLS13, &TLS12],
        Some(("rogue_client.pem", "rogue_client.key")),
    );
    let result = common::https_get(addr, &connector, "/").await;

    assert!(
        !matches!(&result, Ok(response) if response.is_ok()),
        "untrusted client certificate reached the app: {result:?}"
    );

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_mtls_accepts_trusted_client() {
    let server = Server::new(common::demo_app());
    let (addr, _running) = common::spawn_server(&server, common::tls_config(Some("ca.pem"))).await;

    for versions in [&[&TLS12][..], &[&TLS13][..]] {
        let connector = common::tls_connector(versions, Some(("client.pem", "client.key")));
        let response = common::https_get(addr, &connector, "/").await.unwrap();
        assert!(response.is_ok(), "{}", response.raw);
    }

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_tls_hook_mutations_take_effect() {
    let server = Server::new(common::demo_app());
    let config = common::tls_config(None).with_tls_config_hook(|config| {
        if let Some(config) = config {
            // Only complete handshakes with clients that offer this protocol.
            config.alpn_protocols = vec![b"h2".to_vec()];
        }
    });
    let (addr, _running) = common::spawn_server(&server, config).await;

    // rustls refuses a client offering no matching ALPN protocol once the
    // server has a non-empty list and the client sends one.
    let mut client = rustls::ClientConfig::builder_with_provider(server_lifecycle::net::tls::crypto_provider())
        .with_protocol_versions(&[&TLS13])
        .unwrap()
        .with_root_certificates({
            let mut roots = rustls::RootCertStore::empty();
            for cert in server_lifecycle::net::tls::load_certs(&common::fixture("ca.pem")).unwrap() {
                roots.add(cert).unwrap();
            }
            roots
        })
        .with_no_client_auth();
    client.alpn_protocols = vec![b"http/1.1".to_vec()];
    let connector = tokio_rustls::TlsConnector::from(std::sync::Arc::new(client));

    assert!(common::https_get(addr, &connector, "/").await.is_err());

    server.shutdown().await.unwrap();
}
