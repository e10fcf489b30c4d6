//! TLS configuration and certificate loading.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{VerifierBuilderError, WebPkiClientVerifier};
use rustls::{RootCertStore, ServerConfig};
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

use crate::config::ResolvedStartConfig;

/// Protocol versions offered by the server. TLS 1.2 is the floor.
pub static PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Failure to turn PEM files into rustls material.
#[derive(Debug, Error)]
pub enum PemError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("no PEM certificates found")]
    NoCertificates,

    #[error("no PEM private key found")]
    NoPrivateKey,

    #[error(transparent)]
    Rustls(#[from] rustls::Error),

    #[error(transparent)]
    Verifier(#[from] VerifierBuilderError),
}

#[derive(Debug, Error)]
pub enum TlsError {
    /// The server certificate or key could not be loaded.
    #[error("tls: cannot load TLS key pair from cert_file={cert_file:?} and key_file={key_file:?}: {source}")]
    KeyPair {
        cert_file: PathBuf,
        key_file: PathBuf,
        #[source]
        source: PemError,
    },

    /// The client CA bundle could not be loaded.
    #[error("tls: cannot load client certificate bundle from {path:?}: {source}")]
    ClientCert {
        path: PathBuf,
        #[source]
        source: PemError,
    },
}

/// The crypto provider used for every TLS configuration in this crate.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Load a PEM certificate chain.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, PemError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(PemError::NoCertificates);
    }
    Ok(certs)
}

/// Load the first PEM private key (PKCS#8, PKCS#1 or SEC1).
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, PemError> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?.ok_or(PemError::NoPrivateKey)
}

/// Load a PEM bundle of client CAs into a root store.
pub fn load_client_roots(path: &Path) -> Result<RootCertStore, PemError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Build the server TLS configuration from the configured files.
///
/// Returns `Ok(None)` when TLS is not configured. Never falls back to
/// plaintext when the files are configured but unusable.
pub fn load_tls_config(config: &ResolvedStartConfig) -> Result<Option<ServerConfig>, TlsError> {
    let Some((cert_file, key_file)) = config.tls_files() else {
        return Ok(None);
    };

    let key_pair_error = |source: PemError| TlsError::KeyPair {
        cert_file: cert_file.to_path_buf(),
        key_file: key_file.to_path_buf(),
        source,
    };

    let certs = load_certs(cert_file).map_err(key_pair_error)?;
    let key = load_private_key(key_file).map_err(key_pair_error)?;

    let provider = crypto_provider();
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(PROTOCOL_VERSIONS)
        .map_err(|e| key_pair_error(e.into()))?;

    let builder = match &config.cert_client_file {
        Some(path) => {
            let client_cert_error = |source: PemError| TlsError::ClientCert {
                path: path.clone(),
                source,
            };
            let roots = load_client_roots(path).map_err(client_cert_error)?;
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .map_err(|e| client_cert_error(e.into()))?;

            tracing::debug!(client_ca = %path.display(), "Mutual TLS enabled");
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let mut server_config = builder
        .with_single_cert(certs, key)
        .map_err(|e| key_pair_error(e.into()))?;
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Some(server_config))
}

/// Load the TLS configuration and hand it to the configured hook.
///
/// The hook sees `None` when TLS is disabled; whatever it changes is what the
/// listener uses.
pub fn assemble(config: &ResolvedStartConfig) -> Result<Option<Arc<ServerConfig>>, TlsError> {
    let mut server_config = load_tls_config(config)?;

    if let Some(hook) = &config.tls_config_hook {
        hook(server_config.as_mut());
    }

    Ok(server_config.map(Arc::new))
}

/// Wrap a server configuration into an acceptor.
pub fn acceptor(config: Arc<ServerConfig>) -> TlsAcceptor {
    TlsAcceptor::from(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, StartConfig};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("fixtures")
            .join(name)
    }

    fn tls_config(client: Option<PathBuf>) -> StartConfig {
        StartConfig {
            cert_file: Some(fixture("server.pem")),
            cert_key_file: Some(fixture("server.key")),
            cert_client_file: client,
            ..StartConfig::default()
        }
    }

    #[test]
    fn no_files_means_no_tls() {
        assert!(load_tls_config(&resolve(None)).unwrap().is_none());
    }

    #[test]
    fn loads_key_pair_with_alpn() {
        let cfg = load_tls_config(&resolve(Some(tls_config(None)))).unwrap().unwrap();
        assert_eq!(cfg.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }

    #[test]
    fn missing_key_is_key_pair_error() {
        let mut partial = tls_config(None);
        partial.cert_key_file = Some(fixture("missing.key"));

        let err = load_tls_config(&resolve(Some(partial))).unwrap_err();
        match err {
            TlsError::KeyPair { key_file, source, .. } => {
                assert!(key_file.ends_with("missing.key"));
                assert!(matches!(source, PemError::Io(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn certificate_used_as_key_is_rejected() {
        let mut partial = tls_config(None);
        partial.cert_key_file = Some(fixture("server.pem"));

        let err = load_tls_config(&resolve(Some(partial))).unwrap_err();
        assert!(matches!(
            err,
            TlsError::KeyPair { source: PemError::NoPrivateKey, .. }
        ));
    }

    #[test]
    fn client_bundle_errors() {
        let missing = load_tls_config(&resolve(Some(tls_config(Some(fixture("nope.pem"))))));
        assert!(matches!(missing, Err(TlsError::ClientCert { .. })));

        // A key file holds no certificates.
        let empty = load_tls_config(&resolve(Some(tls_config(Some(fixture("client.key"))))));
        assert!(matches!(
            empty,
            Err(TlsError::ClientCert { source: PemError::NoCertificates, .. })
        ));
    }

    #[test]
    fn hook_sees_config_or_none() {
        let saw_some = Arc::new(AtomicBool::new(false));
        let flag = saw_some.clone();
        let partial = tls_config(Some(fixture("ca.pem"))).with_tls_config_hook(move |cfg| {
            if let Some(cfg) = cfg {
                flag.store(true, Ordering::SeqCst);
                cfg.alpn_protocols = vec![b"http/1.1".to_vec()];
            }
        });

        let assembled = assemble(&resolve(Some(partial))).unwrap().unwrap();
        assert!(saw_some.load(Ordering::SeqCst));
        assert_eq!(assembled.alpn_protocols, vec![b"http/1.1".to_vec()]);

        let saw_none = Arc::new(AtomicBool::new(false));
        let flag = saw_none.clone();
        let plain = StartConfig::default().with_tls_config_hook(move |cfg| {
            flag.store(cfg.is_none(), Ordering::SeqCst);
        });
        assert!(assemble(&resolve(Some(plain))).unwrap().is_none());
        assert!(saw_none.load(Ordering::SeqCst));
    }
}
