//! TCP listener construction and the closable accept primitive.
//!
//! # Responsibilities
//! - Parse `host:port` addresses and resolve them for the configured network
//! - Bind sockets through socket2 (reuse-address, reuse-port, v6-only)
//! - Pair the socket with an optional TLS acceptor
//! - Make closing the listener observable by a concurrent accept

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use rustls::ServerConfig;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::config::{ListenerNetwork, ResolvedStartConfig};
use crate::net::tls;

const LISTEN_BACKLOG: i32 = 1024;

/// Error type for listener construction.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("invalid listen address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("failed to resolve listen address {addr:?}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to listen on {addr:?} ({network}): {source}")]
    Bind {
        addr: String,
        network: ListenerNetwork,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot adopt supplied listener: {0}")]
    Adopt(#[source] std::io::Error),
}

/// Why an accept did not yield a connection.
#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("listener closed")]
    Closed,

    #[error("accept failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared handle that closes a [`BoundListener`].
///
/// Closing is idempotent and safe to race with an in-progress accept.
#[derive(Debug, Clone)]
pub struct ListenerCloser {
    closed: Arc<watch::Sender<bool>>,
}

impl ListenerCloser {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            closed: Arc::new(tx),
        }
    }

    /// Close the listener. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn subscribe(&self) -> CloseSignal {
        CloseSignal {
            rx: self.closed.subscribe(),
        }
    }
}

impl Default for ListenerCloser {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a [`ListenerCloser`].
#[derive(Debug, Clone)]
pub struct CloseSignal {
    rx: watch::Receiver<bool>,
}

impl CloseSignal {
    /// Resolves once the listener has been closed.
    pub async fn closed(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A bound listener, optionally negotiating TLS on accepted connections.
pub struct BoundListener {
    inner: TcpListener,
    tls: Option<TlsAcceptor>,
    local_addr: SocketAddr,
    closer: ListenerCloser,
    close_signal: CloseSignal,
}

impl BoundListener {
    fn new(inner: TcpListener, tls: Option<TlsAcceptor>) -> std::io::Result<Self> {
        let local_addr = inner.local_addr()?;
        let closer = ListenerCloser::new();
        let close_signal = closer.subscribe();
        Ok(Self {
            inner,
            tls,
            local_addr,
            closer,
            close_signal,
        })
    }

    /// Take ownership of a caller-supplied listener. No TLS is applied.
    pub fn adopt(listener: std::net::TcpListener) -> Result<Self, ListenerError> {
        listener.set_nonblocking(true).map_err(ListenerError::Adopt)?;
        let inner = TcpListener::from_std(listener).map_err(ListenerError::Adopt)?;
        let bound = Self::new(inner, None).map_err(ListenerError::Adopt)?;

        tracing::info!(address = %bound.local_addr, "Adopted supplied listener");
        Ok(bound)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn tls_acceptor(&self) -> Option<TlsAcceptor> {
        self.tls.clone()
    }

    pub fn closer(&self) -> ListenerCloser {
        self.closer.clone()
    }

    pub fn close_signal(&self) -> CloseSignal {
        self.close_signal.clone()
    }

    /// Accept the next connection.
    ///
    /// Returns [`AcceptError::Closed`] as soon as the listener is closed, even
    /// when the close happens while this call is waiting.
    pub async fn accept(&mut self) -> Result<(TcpStream, SocketAddr), AcceptError> {
        tokio::select! {
            biased;
            _ = self.close_signal.closed() => Err(AcceptError::Closed),
            accepted = self.inner.accept() => accepted.map_err(AcceptError::Io),
        }
    }
}

impl std::fmt::Debug for BoundListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundListener")
            .field("local_addr", &self.local_addr)
            .field("tls", &self.tls.is_some())
            .field("closed", &self.closer.is_closed())
            .finish()
    }
}

/// Options that differ between a standalone bind and a prefork child bind.
#[derive(Debug, Clone, Copy, Default)]
pub struct BindOptions {
    /// Let sibling processes bind the same address (SO_REUSEPORT).
    pub reuse_port: bool,
}

/// Split `host:port`. IPv6 hosts are bracketed; an empty host is allowed.
pub fn split_host_port(addr: &str) -> Result<(&str, &str), ListenerError> {
    let invalid = |reason: &str| ListenerError::InvalidAddress {
        addr: addr.to_string(),
        reason: reason.to_string(),
    };

    if let Some(rest) = addr.strip_prefix('[') {
        let (host, port) = rest.split_once("]:").ok_or_else(|| invalid("missing port"))?;
        return Ok((host, port));
    }

    let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
    if host.contains(':') {
        return Err(invalid("too many colons"));
    }
    Ok((host, port))
}

/// Resolve an address into bind candidates accepted by `network`.
pub async fn resolve_addrs(
    addr: &str,
    network: ListenerNetwork,
) -> Result<Vec<SocketAddr>, ListenerError> {
    let (host, port) = split_host_port(addr)?;
    let port: u16 = port.parse().map_err(|_| ListenerError::InvalidAddress {
        addr: addr.to_string(),
        reason: format!("invalid port {port:?}"),
    })?;

    if host.is_empty() {
        return Ok(network.unspecified(port));
    }

    let candidates: Vec<SocketAddr> = match host.parse::<IpAddr>() {
        Ok(ip) => vec![SocketAddr::new(ip, port)],
        Err(_) => tokio::net::lookup_host((host, port))
            .await
            .map_err(|source| ListenerError::Resolve {
                addr: addr.to_string(),
                source,
            })?
            .collect(),
    };

    let accepted: Vec<SocketAddr> = candidates
        .into_iter()
        .filter(|candidate| network.accepts(candidate))
        .collect();

    if accepted.is_empty() {
        return Err(ListenerError::InvalidAddress {
            addr: addr.to_string(),
            reason: format!("no {network} address for host {host:?}"),
        });
    }
    Ok(accepted)
}

fn open_socket(
    addr: SocketAddr,
    network: ListenerNetwork,
    options: BindOptions,
) -> std::io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    #[cfg(unix)]
    socket.set_reuse_address(true)?;

    if options.reuse_port {
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos", target_os = "cygwin"))))]
        socket.set_reuse_port(true)?;

        #[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos", target_os = "cygwin")))))]
        return Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "SO_REUSEPORT is not available on this platform",
        ));
    }

    if addr.is_ipv6() {
        socket.set_only_v6(network == ListenerNetwork::Tcp6)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

/// Bind `addr` on the configured network, wrapped in TLS when `tls` is set.
///
/// The address hook runs once, after a successful bind.
pub async fn bind(
    addr: &str,
    config: &ResolvedStartConfig,
    tls: Option<Arc<ServerConfig>>,
    options: BindOptions,
) -> Result<BoundListener, ListenerError> {
    let network = config.listener_network;
    let candidates = resolve_addrs(addr, network).await?;

    let bind_error = |source: std::io::Error| ListenerError::Bind {
        addr: addr.to_string(),
        network,
        source,
    };

    let mut last_error = None;
    let mut std_listener = None;
    for candidate in candidates {
        match open_socket(candidate, network, options) {
            Ok(listener) => {
                std_listener = Some(listener);
                break;
            }
            Err(e) => {
                let fatal = matches!(
                    e.kind(),
                    std::io::ErrorKind::AddrInUse | std::io::ErrorKind::PermissionDenied
                );
                tracing::debug!(candidate = %candidate, error = %e, "Bind attempt failed");
                last_error = Some(e);
                if fatal {
                    break;
                }
            }
        }
    }

    let std_listener = match std_listener {
        Some(listener) => listener,
        None => {
            let source = last_error.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no address to bind")
            });
            return Err(bind_error(source));
        }
    };

    let inner = TcpListener::from_std(std_listener).map_err(bind_error)?;
    let bound = BoundListener::new(inner, tls.map(tls::acceptor)).map_err(bind_error)?;

    tracing::info!(
        address = %bound.local_addr(),
        network = %network,
        tls = bound.is_tls(),
        reuse_port = options.reuse_port,
        "Listener bound"
    );

    if let Some(hook) = &config.listener_addr_hook {
        hook(bound.local_addr());
    }

    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, StartConfig};
    use std::time::Duration;

    #[test]
    fn split_handles_all_forms() {
        assert_eq!(split_host_port(":8080").unwrap(), ("", "8080"));
        assert_eq!(split_host_port("127.0.0.1:80").unwrap(), ("127.0.0.1", "80"));
        assert_eq!(split_host_port("[::1]:443").unwrap(), ("::1", "443"));
        assert_eq!(split_host_port("localhost:0").unwrap(), ("localhost", "0"));
        assert!(split_host_port("8080").is_err());
        assert!(split_host_port("::1:80").is_err());
        assert!(split_host_port("[::1]").is_err());
    }

    #[tokio::test]
    async fn resolve_filters_by_family() {
        let v4 = resolve_addrs("127.0.0.1:0", ListenerNetwork::Tcp4).await.unwrap();
        assert_eq!(v4, vec!["127.0.0.1:0".parse::<SocketAddr>().unwrap()]);

        let err = resolve_addrs("127.0.0.1:0", ListenerNetwork::Tcp6).await.unwrap_err();
        assert!(matches!(err, ListenerError::InvalidAddress { .. }));

        let err = resolve_addrs("127.0.0.1:http", ListenerNetwork::Tcp4).await.unwrap_err();
        assert!(matches!(err, ListenerError::InvalidAddress { .. }));

        let any = resolve_addrs(":9000", ListenerNetwork::Tcp4).await.unwrap();
        assert_eq!(any, vec!["0.0.0.0:9000".parse::<SocketAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn bind_reports_address_and_conflicts() {
        let config = resolve(None);
        let first = bind("127.0.0.1:0", &config, None, BindOptions::default())
            .await
            .unwrap();
        assert!(!first.is_tls());

        let taken = first.local_addr().to_string();
        let err = bind(&taken, &config, None, BindOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ListenerError::Bind { .. }));
    }

    #[tokio::test]
    async fn close_interrupts_pending_accept() {
        let config = resolve(Some(StartConfig::default()));
        let mut listener = bind("127.0.0.1:0", &config, None, BindOptions::default())
            .await
            .unwrap();
        let closer = listener.closer();

        let pending = tokio::spawn(async move { listener.accept().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(closer.close());
        assert!(!closer.close(), "second close is a no-op");

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(AcceptError::Closed)));
    }

    #[tokio::test]
    async fn adopt_keeps_address_without_tls() {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();

        let adopted = BoundListener::adopt(std_listener).unwrap();
        assert_eq!(adopted.local_addr(), addr);
        assert!(!adopted.is_tls());
    }
}
