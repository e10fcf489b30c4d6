//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ProtocolVersion, RootCertStore, SupportedProtocolVersion};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

use server_lifecycle::net::tls::{crypto_provider, load_certs, load_private_key};
use server_lifecycle::{App, Server, StartConfig, StartError};

/// Path of a PEM file under `tests/fixtures`.
pub fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// Config with the server key pair and, optionally, a client CA bundle.
pub fn tls_config(client_ca: Option<&str>) -> StartConfig {
    StartConfig {
        cert_file: Some(fixture("server.pem")),
        cert_key_file: Some(fixture("server.key")),
        cert_client_file: client_ca.map(fixture),
        ..StartConfig::default()
    }
}

/// App with a fast route and a slow one.
pub fn demo_app() -> App {
    App::new()
        .name("integration")
        .get("/", || async { "hello" })
        .get("/slow", || async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            "slow done"
        })
        .get("/hang", || async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            "finally"
        })
}

/// Start `server` on an ephemeral port and wait until it has bound.
pub async fn spawn_server(
    server: &Server,
    config: StartConfig,
) -> (SocketAddr, JoinHandle<Result<(), StartError>>) {
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    let config = StartConfig {
        disable_startup_message: true,
        ..config
    }
    .with_listener_addr_hook(move |addr| {
        if let Some(tx) = tx.lock().unwrap().take() {
            let _ = tx.send(addr);
        }
    });

    let server = server.clone();
    let handle = tokio::spawn(async move { server.start("127.0.0.1:0", Some(config)).await });

    let addr = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("server did not bind in time")
        .expect("server exited before binding");
    (addr, handle)
}

/// Plain HTTP GET returning status and body.
pub async fn get(addr: SocketAddr, path: &str) -> reqwest::Result<(u16, String)> {
    let response = reqwest::get(format!("http://{addr}{path}")).await?;
    let status = response.status().as_u16();
    Ok((status, response.text().await?))
}

/// TLS connector trusting the test CA, optionally presenting a client certificate.
pub fn tls_connector(
    versions: &[&'static SupportedProtocolVersion],
    client_identity: Option<(&str, &str)>,
) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(&fixture("ca.pem")).unwrap() {
        roots.add(cert).unwrap();
    }

    let builder = ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(versions)
        .unwrap()
        .with_root_certificates(roots);

    let config = match client_identity {
        Some((cert, key)) => builder
            .with_client_auth_cert(
                load_certs(&fixture(cert)).unwrap(),
                load_private_key(&fixture(key)).unwrap(),
            )
            .unwrap(),
        None => builder.with_no_client_auth(),
    };

    TlsConnector::from(Arc::new(config))
}

/// Outcome of a raw HTTPS request.
#[derive(Debug)]
pub struct TlsResponse {
    pub version: Option<ProtocolVersion>,
    pub raw: String,
}

impl TlsResponse {
    pub fn is_ok(&self) -> bool {
        self.raw.starts_with("HTTP/1.1 200")
    }
}

/// Send `GET path` over TLS and read the raw response until the server closes.
pub async fn https_get(
    addr: SocketAddr,
    connector: &TlsConnector,
    path: &str,
) -> std::io::Result<TlsResponse> {
    let stream = TcpStream::connect(addr).await?;
    let domain = ServerName::try_from("localhost").expect("valid server name");
    let mut tls = connector.connect(domain, stream).await?;
    let version = tls.get_ref().1.protocol_version();

    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    tls.write_all(request.as_bytes()).await?;

    let mut raw = String::new();
    tls.read_to_string(&mut raw).await?;
    Ok(TlsResponse { version, raw })
}
