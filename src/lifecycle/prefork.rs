//! Multi-process listener sharing.
//!
//! # Responsibilities
//! - Parent: re-execute the binary once per child, wait for all of them
//! - Child: bind with SO_REUSEPORT and serve like a standalone process
//! - Child: stop serving when the parent goes away
//!
//! # Design Decisions
//! - The parent never binds the address
//! - The first failed child stops the whole group
//! - Children are killed if the parent drops them

use std::collections::HashSet;
use std::ffi::OsString;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Sleep;

use crate::config::{ListenerNetwork, ResolvedStartConfig, PREFORK_CHILD_ENV};
use crate::http::{App, ServeHandle};
use crate::lifecycle::signals;
use crate::net::{listener, BindOptions, BoundListener, ListenerError};
use crate::observability::diagnostics;

/// How often a child checks whether its parent is still alive.
pub const PARENT_CHECK_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum PreforkError {
    #[error("prefork requires network tcp4 or tcp6, got {0}")]
    UnsupportedNetwork(ListenerNetwork),

    #[error("prefork is only supported on unix platforms")]
    Unsupported,

    #[error("failed to spawn prefork child: {0}")]
    Spawn(#[source] io::Error),

    #[error("prefork child {pid} exited with {status}")]
    ChildFailed { pid: u32, status: ExitStatus },

    #[error("failed to wait for prefork child {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("cannot inspect process or listener: {0}")]
    Metadata(#[source] io::Error),
}

/// Address and network every prefork child binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreforkTarget {
    pub network: ListenerNetwork,
    pub addr: String,
}

impl PreforkTarget {
    pub fn new(addr: impl Into<String>, network: ListenerNetwork) -> Result<Self, PreforkError> {
        if !network.is_single_stack() {
            return Err(PreforkError::UnsupportedNetwork(network));
        }
        Ok(Self {
            network,
            addr: addr.into(),
        })
    }

    /// Derive the target from a supplied listener, then close it so the
    /// children can bind the same address.
    pub fn from_listener(listener: std::net::TcpListener) -> Result<Self, PreforkError> {
        let local = listener.local_addr().map_err(PreforkError::Metadata)?;
        drop(listener);

        let network = match local {
            SocketAddr::V4(_) => ListenerNetwork::Tcp4,
            SocketAddr::V6(_) => ListenerNetwork::Tcp6,
        };
        Self::new(local.to_string(), network)
    }
}

/// Program and arguments used to start a child.
#[derive(Debug, Clone)]
pub struct PreforkCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl PreforkCommand {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// The running binary with its own arguments.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: std::env::args_os().skip(1).collect(),
        })
    }

    fn to_command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .env(PREFORK_CHILD_ENV, "1")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

/// Exit of one child.
#[derive(Debug)]
pub struct ChildExit {
    pub pid: u32,
    pub status: io::Result<ExitStatus>,
}

/// Live children of a prefork parent.
pub struct ChildProcessSet {
    alive: HashSet<u32>,
    tasks: JoinSet<ChildExit>,
    kill: watch::Sender<bool>,
}

impl ChildProcessSet {
    pub fn new() -> Self {
        let (kill, _) = watch::channel(false);
        Self {
            alive: HashSet::new(),
            tasks: JoinSet::new(),
            kill,
        }
    }

    /// Start a child and watch it until it exits or is terminated.
    pub fn spawn(&mut self, command: &mut tokio::process::Command) -> io::Result<u32> {
        let mut child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("child exited before its pid was read"))?;
        let mut kill = self.kill.subscribe();

        self.tasks.spawn(async move {
            let terminated = async {
                while !*kill.borrow_and_update() {
                    if kill.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            };

            let status = tokio::select! {
                status = child.wait() => status,
                _ = terminated => {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!(pid, error = %e, "Kill failed, child already gone");
                    }
                    child.wait().await
                }
            };
            ChildExit { pid, status }
        });

        self.alive.insert(pid);
        Ok(pid)
    }

    /// Kill every child that is still running.
    pub fn terminate(&self) {
        if !self.kill.send_replace(true) && self.live_count() > 0 {
            tracing::info!(children = self.live_count(), "Terminating prefork children");
        }
    }

    /// Wait for the next child to exit. `None` once every child has exited.
    pub async fn next_exit(&mut self) -> Option<ChildExit> {
        loop {
            match self.tasks.join_next().await? {
                Ok(exit) => {
                    self.alive.remove(&exit.pid);
                    return Some(exit);
                }
                Err(e) => tracing::error!(error = %e, "Prefork child watcher failed"),
            }
        }
    }

    /// Pids of children that have not exited yet.
    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.alive.iter().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.alive.contains(&pid)
    }

    pub fn live_count(&self) -> usize {
        self.alive.len()
    }

    /// Terminate everything and wait until the set is empty.
    pub async fn shutdown(&mut self) {
        self.terminate();
        while self.next_exit().await.is_some() {}
    }
}

impl Default for ChildProcessSet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChildProcessSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildProcessSet")
            .field("alive", &self.alive)
            .field("terminating", &*self.kill.borrow())
            .finish()
    }
}

/// Number of children to start.
pub fn process_count(config: &ResolvedStartConfig) -> usize {
    config
        .prefork_processes
        .map(|n| n.get())
        .unwrap_or_else(num_cpus::get)
}

/// Run the prefork parent until every child has exited.
///
/// `tls` only tells the banner which scheme the children serve; each child
/// loads its own TLS material.
#[cfg(unix)]
pub async fn run_parent(
    app: &App,
    command: &PreforkCommand,
    target: &PreforkTarget,
    tls: Option<&Arc<ServerConfig>>,
    config: &ResolvedStartConfig,
) -> Result<(), PreforkError> {
    let count = process_count(config);
    let mut children = ChildProcessSet::new();

    for _ in 0..count {
        let mut child = command.to_command();
        match children.spawn(&mut child) {
            Ok(pid) => {
                tracing::debug!(pid, "Prefork child started");
                app.run_fork_hooks(pid);
            }
            Err(e) => {
                tracing::error!(error = %e, program = %command.program.display(), "Failed to spawn prefork child");
                children.shutdown().await;
                return Err(PreforkError::Spawn(e));
            }
        }
    }

    tracing::info!(
        address = %target.addr,
        network = %target.network,
        children = count,
        "Prefork parent started"
    );
    diagnostics::print_startup(app, &target.addr, tls.is_some(), config, &children.pids());

    let mut first_error: Option<PreforkError> = None;
    let mut signal = std::pin::pin!(signals::wait_for_any(&config.graceful_signals));
    let mut signalled = false;
    let mut deadline: Option<Pin<Box<Sleep>>> = None;

    loop {
        tokio::select! {
            exit = children.next_exit() => {
                let Some(ChildExit { pid, status }) = exit else {
                    break;
                };
                let failure = match status {
                    Ok(status) if status.success() => {
                        tracing::info!(pid, "Prefork child exited");
                        None
                    }
                    Ok(status) => {
                        tracing::error!(pid, status = %status, "Prefork child failed");
                        Some(PreforkError::ChildFailed { pid, status })
                    }
                    Err(source) => Some(PreforkError::Wait { pid, source }),
                };
                if let (Some(failure), None) = (failure, &first_error) {
                    first_error = Some(failure);
                    children.terminate();
                }
            }
            received = &mut signal, if !signalled => {
                signalled = true;
                match received {
                    Ok(trigger) => {
                        tracing::info!(
                            signal = %trigger,
                            timeout_ms = config.graceful_timeout.as_millis() as u64,
                            "Waiting for prefork children to exit"
                        );
                        deadline = Some(Box::pin(tokio::time::sleep(config.graceful_timeout)));
                    }
                    Err(e) => tracing::warn!(error = %e, "Cannot install signal handlers in prefork parent"),
                }
            }
            _ = expired(&mut deadline) => {
                deadline = None;
                tracing::warn!(children = children.live_count(), "Prefork children did not exit in time");
                children.terminate();
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => {
            tracing::info!("All prefork children exited");
            Ok(())
        }
    }
}

#[cfg(not(unix))]
pub async fn run_parent(
    _app: &App,
    _command: &PreforkCommand,
    _target: &PreforkTarget,
    _tls: Option<&Arc<ServerConfig>>,
    _config: &ResolvedStartConfig,
) -> Result<(), PreforkError> {
    Err(PreforkError::Unsupported)
}

async fn expired(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Bind the child's share of `target`.
pub async fn child_listener(
    target: &PreforkTarget,
    tls: Option<Arc<ServerConfig>>,
    config: &ResolvedStartConfig,
) -> Result<BoundListener, ListenerError> {
    let mut config = config.clone();
    config.listener_network = target.network;
    listener::bind(&target.addr, &config, tls, BindOptions { reuse_port: true }).await
}

/// Drain `handle` once the parent process is gone.
#[cfg(unix)]
pub async fn watch_parent(handle: ServeHandle) {
    let parent = std::os::unix::process::parent_id();
    let mut ticker = tokio::time::interval(PARENT_CHECK_INTERVAL);

    loop {
        ticker.tick().await;
        let current = std::os::unix::process::parent_id();
        if current != parent {
            tracing::warn!(parent, current, "Prefork parent exited, draining child");
            if let Err(e) = handle.drain().await {
                tracing::error!(error = %e, "Orphaned child failed to drain");
            }
            return;
        }
    }
}

#[cfg(not(unix))]
pub async fn watch_parent(_handle: ServeHandle) {
    std::future::pending().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_rejects_dual_stack() {
        let err = PreforkTarget::new(":3000", ListenerNetwork::Tcp).unwrap_err();
        assert!(matches!(err, PreforkError::UnsupportedNetwork(ListenerNetwork::Tcp)));
        assert!(PreforkTarget::new(":3000", ListenerNetwork::Tcp6).is_ok());
    }

    #[test]
    fn target_from_listener_releases_the_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let target = PreforkTarget::from_listener(listener).unwrap();
        assert_eq!(target.network, ListenerNetwork::Tcp4);
        assert_eq!(target.addr, addr.to_string());

        std::net::TcpListener::bind(addr).expect("address should be free again");
    }

    #[test]
    fn command_marks_children() {
        let command = PreforkCommand::new("/bin/app", ["--port", "3000"]).to_command();
        let inner = command.as_std();
        assert_eq!(inner.get_program(), "/bin/app");
        assert_eq!(inner.get_args().collect::<Vec<_>>(), ["--port", "3000"]);
        assert!(inner.get_envs().any(|(key, value)| {
            key == PREFORK_CHILD_ENV && value == Some(std::ffi::OsStr::new("1"))
        }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_set_tracks_exits() {
        let mut children = ChildProcessSet::new();
        let ok = children.spawn(&mut tokio::process::Command::new("true")).unwrap();
        let failed = children.spawn(&mut tokio::process::Command::new("false")).unwrap();
        assert_eq!(children.live_count(), 2);
        assert_eq!(children.pids().len(), 2);

        let mut statuses = std::collections::HashMap::new();
        while let Some(exit) = children.next_exit().await {
            statuses.insert(exit.pid, exit.status.unwrap().success());
        }

        assert!(statuses[&ok]);
        assert!(!statuses[&failed]);
        assert_eq!(children.live_count(), 0);
        assert!(!children.is_alive(ok));
        assert!(children.pids().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_kills_running_children() {
        let mut children = ChildProcessSet::new();
        let mut sleeper = tokio::process::Command::new("sleep");
        sleeper.arg("30").kill_on_drop(true);
        children.spawn(&mut sleeper).unwrap();

        children.terminate();
        let exit = tokio::time::timeout(Duration::from_secs(5), children.next_exit())
            .await
            .unwrap()
            .unwrap();
        assert!(!exit.status.unwrap().success());
        assert!(children.next_exit().await.is_none());
    }
}
