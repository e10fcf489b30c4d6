//! Startup orchestration.
//!
//! # Responsibilities
//! - Resolve configuration and assemble TLS before anything binds
//! - Pick the startup strategy: bind, adopt a supplied listener, or prefork
//! - Run hooks, build the dispatch tree and print diagnostics before accepting
//! - Attach the graceful shutdown controller next to the accept loop
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal and returned to the caller
//! - Listeners are owned values, so an early return releases the port
//! - Listeners start last (traffic only when ready)

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

use crate::config::{resolve, BoxError, ProcessRole, ResolvedStartConfig, StartConfig};
use crate::http::{server, App, DrainError, ServeError, ServeHandle};
use crate::lifecycle::prefork::{self, PreforkCommand, PreforkError, PreforkTarget};
use crate::lifecycle::shutdown::{GracefulShutdown, ShutdownError, ShutdownState};
use crate::net::{self, tls, BoundListener, ConnectionTracker, ListenerError, TlsError};
use crate::observability::diagnostics;

/// Where to serve: an address to bind, or a listener bound by the caller.
#[derive(Debug)]
pub enum ListenTarget {
    /// `host:port`; an empty host binds every interface.
    Address(String),
    Listener(std::net::TcpListener),
}

impl ListenTarget {
    /// Take over a tokio listener.
    pub fn from_tokio(listener: tokio::net::TcpListener) -> std::io::Result<Self> {
        Ok(Self::Listener(listener.into_std()?))
    }
}

impl From<&str> for ListenTarget {
    fn from(addr: &str) -> Self {
        Self::Address(addr.to_string())
    }
}

impl From<String> for ListenTarget {
    fn from(addr: String) -> Self {
        Self::Address(addr)
    }
}

impl From<SocketAddr> for ListenTarget {
    fn from(addr: SocketAddr) -> Self {
        Self::Address(addr.to_string())
    }
}

impl From<std::net::TcpListener> for ListenTarget {
    fn from(listener: std::net::TcpListener) -> Self {
        Self::Listener(listener)
    }
}

/// Which user hook aborted startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    OnListen,
    BeforeServe,
}

impl std::fmt::Display for HookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookKind::OnListen => f.write_str("on-listen"),
            HookKind::BeforeServe => f.write_str("before-serve"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Listen(#[from] ListenerError),

    #[error(transparent)]
    Prefork(#[from] PreforkError),

    #[error("{hook} hook failed: {source}")]
    Hook {
        hook: HookKind,
        #[source]
        source: BoxError,
    },

    #[error(transparent)]
    Serve(#[from] ServeError),
}

impl StartError {
    /// The listener was closed on purpose, normally by [`Server::shutdown`].
    pub fn is_listener_closed(&self) -> bool {
        matches!(self, StartError::Serve(ServeError::ListenerClosed))
    }
}

struct Inner {
    app: App,
    serving: Mutex<Option<ServeHandle>>,
    shutdown_state: Mutex<Option<watch::Receiver<ShutdownState>>>,
}

/// Runs an [`App`]: binds, serves and shuts down.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
    prefork_command: Option<PreforkCommand>,
}

impl Server {
    pub fn new(app: App) -> Self {
        Self {
            inner: Arc::new(Inner {
                app,
                serving: Mutex::new(None),
                shutdown_state: Mutex::new(None),
            }),
            prefork_command: None,
        }
    }

    /// Start prefork children with `command` instead of re-running this binary.
    pub fn with_prefork_command(mut self, command: PreforkCommand) -> Self {
        self.prefork_command = Some(command);
        self
    }

    pub fn app(&self) -> &App {
        &self.inner.app
    }

    /// Serve the app on `target` until the listener is closed.
    ///
    /// Returns `Ok(())` only from a prefork parent whose children all exited
    /// cleanly. A drained standalone server returns
    /// `Err(StartError::Serve(ServeError::ListenerClosed))`.
    pub async fn start(
        &self,
        target: impl Into<ListenTarget>,
        config: Option<StartConfig>,
    ) -> Result<(), StartError> {
        let mut partial = config.unwrap_or_default();
        if partial.role.is_none() {
            partial.role = Some(ProcessRole::current());
        }
        let mut config = resolve(Some(partial));

        let listener = match (target.into(), config.enable_prefork) {
            (ListenTarget::Address(addr), false) => net::build_listener(&addr, &config).await?,
            (ListenTarget::Listener(supplied), false) => {
                // Bad TLS files still fail startup; the supplied socket is served plain.
                tls::assemble(&config)?;
                BoundListener::adopt(supplied)?
            }
            (target, true) => {
                let tls = tls::assemble(&config)?;
                let target = match target {
                    ListenTarget::Address(addr) => PreforkTarget::new(addr, config.listener_network)?,
                    ListenTarget::Listener(supplied) => PreforkTarget::from_listener(supplied)?,
                };

                if !config.role.is_prefork_child() {
                    config.role = ProcessRole::PreforkParent;
                    let command = match &self.prefork_command {
                        Some(command) => command.clone(),
                        None => PreforkCommand::current_exe().map_err(PreforkError::Metadata)?,
                    };
                    prefork::run_parent(&self.inner.app, &command, &target, tls.as_ref(), &config).await?;
                    return Ok(());
                }

                prefork::child_listener(&target, tls, &config).await?
            }
        };

        self.serve(listener, config).await
    }

    async fn serve(&self, listener: BoundListener, config: ResolvedStartConfig) -> Result<(), StartError> {
        let app = &self.inner.app;

        app.run_listen_hooks().map_err(|source| StartError::Hook {
            hook: HookKind::OnListen,
            source,
        })?;

        let router = app.build_tree();

        diagnostics::print_startup(
            app,
            &listener.local_addr().to_string(),
            listener.is_tls(),
            &config,
            &[],
        );

        if let Some(hook) = &config.before_serve_hook {
            hook(app).map_err(|source| StartError::Hook {
                hook: HookKind::BeforeServe,
                source,
            })?;
        }

        let tracker = ConnectionTracker::new();
        let handle = ServeHandle::new(&listener, tracker.clone());
        *lock(&self.inner.serving) = Some(handle.clone());

        let controller = GracefulShutdown::from_config(&config);
        let state = controller.state();
        *lock(&self.inner.shutdown_state) = Some(state.clone());

        let drain_handle = handle.clone();
        let controller_task = tokio::spawn(
            controller.run(config.graceful_signals.clone(), move || async move { drain_handle.drain().await }),
        );

        let parent_watcher = config
            .role
            .is_prefork_child()
            .then(|| tokio::spawn(prefork::watch_parent(handle.clone())));

        let err = server::serve(listener, router, tracker).await;

        if let Some(watcher) = parent_watcher {
            watcher.abort();
        }
        lock(&self.inner.serving).take();

        let controller_state = *state.borrow();
        if controller_state == ShutdownState::Running {
            controller_task.abort();
        } else {
            // The controller owns the exit code from here on.
            tracing::debug!(state = ?controller_state, "Waiting for shutdown controller");
            if let Err(e) = controller_task.await {
                tracing::error!(error = %e, "Shutdown controller failed");
            }
        }

        Err(StartError::Serve(err))
    }

    /// Close the listener and wait for in-flight connections to finish.
    ///
    /// The graceful shutdown controller is stopped without running. Tokio
    /// keeps the handlers it installed for the configured signals for the rest
    /// of the process, so those signals (Ctrl+C included) no longer terminate
    /// it. A caller that keeps running afterwards must handle them itself.
    pub async fn shutdown(&self) -> Result<(), DrainError> {
        let handle = lock(&self.inner.serving).clone().ok_or(DrainError::NotServing)?;
        handle.drain().await
    }

    /// [`Server::shutdown`] bounded by `timeout`.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<(), ShutdownError> {
        match tokio::time::timeout(timeout, self.shutdown()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ShutdownError::Timeout(timeout)),
        }
    }

    /// State of the graceful shutdown controller, once serving has started.
    pub fn shutdown_state(&self) -> Option<watch::Receiver<ShutdownState>> {
        lock(&self.inner.shutdown_state).clone()
    }

    pub fn is_serving(&self) -> bool {
        lock(&self.inner.serving).is_some()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("app", &self.inner.app)
            .field("serving", &self.is_serving())
            .field("prefork_command", &self.prefork_command)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_convert() {
        assert!(matches!(ListenTarget::from(":3000"), ListenTarget::Address(a) if a == ":3000"));
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        assert!(matches!(ListenTarget::from(addr), ListenTarget::Address(a) if a == "127.0.0.1:8080"));

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        assert!(matches!(ListenTarget::from(listener), ListenTarget::Listener(_)));
    }

    #[tokio::test]
    async fn tokio_listener_converts() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        match ListenTarget::from_tokio(listener).unwrap() {
            ListenTarget::Listener(std_listener) => assert_eq!(std_listener.local_addr().unwrap(), addr),
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[test]
    fn listener_closed_is_recognised() {
        assert!(StartError::Serve(ServeError::ListenerClosed).is_listener_closed());
        let hook = StartError::Hook {
            hook: HookKind::BeforeServe,
            source: "nope".into(),
        };
        assert!(!hook.is_listener_closed());
        assert_eq!(hook.to_string(), "before-serve hook failed: nope");
    }

    #[tokio::test]
    async fn shutdown_before_start_is_not_serving() {
        let server = Server::new(App::new());
        assert!(matches!(server.shutdown().await, Err(DrainError::NotServing)));
        assert!(matches!(
            server.shutdown_with_timeout(Duration::from_secs(1)).await,
            Err(ShutdownError::Drain(DrainError::NotServing))
        ));
        assert!(server.shutdown_state().is_none());
    }
}
