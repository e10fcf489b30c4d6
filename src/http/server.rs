//! Accept loop and per-connection serving.
//!
//! # Responsibilities
//! - Accept connections from a [`BoundListener`] until it is closed
//! - Run the TLS handshake when the listener carries an acceptor
//! - Serve HTTP/1.1 and HTTP/2 through hyper with the app's router
//! - Tell live connections to finish when the listener closes
//! - Drop connections still in their TLS handshake when the listener closes
//!
//! # Design Decisions
//! - Closing the listener is the only way to stop the loop
//! - Transient accept errors never end the loop
//! - The drain waits on the connection tracker, never on a timer

use std::io;
use std::net::SocketAddr;
use std::pin::pin;
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::net::{AcceptError, BoundListener, CloseSignal, ConnectionTracker, ListenerCloser};

/// Upper bound on a client's TLS handshake.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after the process runs out of descriptors or buffers.
const RESOURCE_BACKOFF: Duration = Duration::from_millis(100);

/// Why the accept loop stopped.
#[derive(Debug, Error)]
pub enum ServeError {
    /// The listener was closed, normally by a drain.
    #[error("listener closed")]
    ListenerClosed,

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum DrainError {
    #[error("server is not serving")]
    NotServing,
}

/// Handle onto a running accept loop, used to drain it.
#[derive(Debug, Clone)]
pub struct ServeHandle {
    closer: ListenerCloser,
    tracker: ConnectionTracker,
}

impl ServeHandle {
    pub fn new(listener: &BoundListener, tracker: ConnectionTracker) -> Self {
        Self {
            closer: listener.closer(),
            tracker,
        }
    }

    /// Stop accepting, ask live connections to finish, and wait until they have.
    pub async fn drain(&self) -> Result<(), DrainError> {
        if self.closer.close() {
            tracing::info!(
                active = self.tracker.active_count(),
                "Listener closed, draining connections"
            );
        }
        self.tracker.wait_idle().await;
        tracing::info!("All connections drained");
        Ok(())
    }

    pub fn active_connections(&self) -> usize {
        self.tracker.active_count()
    }
}

/// Serve `router` on `listener` until the listener is closed or accept fails
/// unrecoverably. The listener is dropped before this returns.
pub async fn serve(mut listener: BoundListener, router: Router, tracker: ConnectionTracker) -> ServeError {
    let _loop_guard = tracker.track();
    let tls = listener.tls_acceptor();
    let local_addr = listener.local_addr();

    tracing::info!(address = %local_addr, tls = tls.is_some(), "HTTP server accepting connections");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(AcceptError::Closed) => {
                drop(listener);
                tracing::info!(address = %local_addr, "HTTP server stopped accepting");
                return ServeError::ListenerClosed;
            }
            Err(AcceptError::Io(e)) if is_connection_error(&e) => {
                tracing::debug!(error = %e, "Connection failed before accept completed");
                continue;
            }
            Err(AcceptError::Io(e)) if is_resource_exhaustion(&e) => {
                tracing::warn!(error = %e, "Accept failed, backing off");
                tokio::time::sleep(RESOURCE_BACKOFF).await;
                continue;
            }
            Err(AcceptError::Io(e)) => {
                tracing::error!(error = %e, "Accept failed");
                return ServeError::Accept(e);
            }
        };

        let guard = tracker.track();
        let router = router.clone();
        let tls = tls.clone();
        let close_signal = listener.close_signal();

        tokio::spawn(async move {
            tracing::trace!(connection_id = %guard.id(), peer = %peer, "Connection accepted");
            handle_connection(stream, peer, tls, router, close_signal).await;
            drop(guard);
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    router: Router,
    mut close_signal: CloseSignal,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::trace!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }

    match tls {
        Some(acceptor) => {
            let handshake = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream));
            // No request can be in flight before the handshake completes.
            let handshake = tokio::select! {
                biased;
                _ = close_signal.closed() => {
                    tracing::debug!(peer = %peer, "Listener closed during TLS handshake");
                    return;
                }
                handshake = handshake => handshake,
            };
            match handshake {
                Ok(Ok(tls_stream)) => serve_io(tls_stream, peer, router, close_signal).await,
                Ok(Err(e)) => tracing::debug!(peer = %peer, error = %e, "TLS handshake rejected"),
                Err(_) => tracing::debug!(peer = %peer, "TLS handshake timed out"),
            }
        }
        None => serve_io(stream, peer, router, close_signal).await,
    }
}

async fn serve_io<I>(io: I, peer: SocketAddr, router: Router, mut close_signal: CloseSignal)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let builder = Builder::new(TokioExecutor::new());
    let service = TowerToHyperService::new(router);
    let mut connection = pin!(builder.serve_connection_with_upgrades(TokioIo::new(io), service));
    let mut closed = pin!(close_signal.closed());
    let mut draining = false;

    loop {
        tokio::select! {
            result = connection.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(peer = %peer, error = %e, "Connection ended with error");
                }
                break;
            }
            _ = closed.as_mut(), if !draining => {
                draining = true;
                connection.as_mut().graceful_shutdown();
            }
        }
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

fn is_resource_exhaustion(e: &io::Error) -> bool {
    // ENFILE, EMFILE and ENOBUFS have no stable ErrorKind.
    const ENFILE: i32 = 23;
    const EMFILE: i32 = 24;
    #[cfg(target_os = "linux")]
    const ENOBUFS: i32 = 105;
    #[cfg(not(target_os = "linux"))]
    const ENOBUFS: i32 = 55;

    if e.kind() == io::ErrorKind::OutOfMemory {
        return true;
    }
    cfg!(unix) && matches!(e.raw_os_error(), Some(ENFILE | EMFILE | ENOBUFS))
}
