//! Startup configuration definitions.
//!
//! [`StartConfig`] is the partially-filled value callers hand to
//! [`Server::start`](crate::Server::start); [`resolve`] merges it with the
//! compiled-in defaults into a [`ResolvedStartConfig`] where every
//! default-bearing field holds a concrete value.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::http::App;
use crate::lifecycle::shutdown::ShutdownError;

/// Error type returned by user-supplied hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Mutates the assembled TLS configuration before the listener binds.
///
/// Receives `None` when TLS is disabled. Cannot fail the listener factory.
pub type TlsConfigHook = Arc<dyn Fn(Option<&mut rustls::ServerConfig>) + Send + Sync>;

/// Observes the final bound address (useful with port 0).
pub type ListenerAddrHook = Arc<dyn Fn(SocketAddr) + Send + Sync>;

/// Last chance to inspect the application before connections are accepted.
/// An error aborts startup.
pub type BeforeServeHook = Arc<dyn Fn(&App) -> Result<(), BoxError> + Send + Sync>;

/// Receives the terminal error of a graceful shutdown.
pub type ShutdownErrorHook = Arc<dyn Fn(ShutdownError) + Send + Sync>;

/// Default drain bound for graceful shutdown.
pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment marker set on prefork children by the coordinator.
pub const PREFORK_CHILD_ENV: &str = "SERVER_LIFECYCLE_PREFORK_CHILD";

/// Network kind used when binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerNetwork {
    /// IPv4 and IPv6 (dual-stack when the host is empty).
    Tcp,
    /// IPv4 only.
    #[default]
    Tcp4,
    /// IPv6 only.
    Tcp6,
}

impl ListenerNetwork {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerNetwork::Tcp => "tcp",
            ListenerNetwork::Tcp4 => "tcp4",
            ListenerNetwork::Tcp6 => "tcp6",
        }
    }

    /// Whether an address of this family may be bound on this network.
    pub fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            ListenerNetwork::Tcp => true,
            ListenerNetwork::Tcp4 => addr.is_ipv4(),
            ListenerNetwork::Tcp6 => addr.is_ipv6(),
        }
    }

    /// Candidate wildcard addresses for an empty host, in bind order.
    pub fn unspecified(&self, port: u16) -> Vec<SocketAddr> {
        let v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
        match self {
            ListenerNetwork::Tcp => vec![v6, v4],
            ListenerNetwork::Tcp4 => vec![v4],
            ListenerNetwork::Tcp6 => vec![v6],
        }
    }

    /// Single-stack networks can be shared across prefork children.
    pub fn is_single_stack(&self) -> bool {
        !matches!(self, ListenerNetwork::Tcp)
    }
}

impl fmt::Display for ListenerNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListenerNetwork {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(ListenerNetwork::Tcp),
            "tcp4" => Ok(ListenerNetwork::Tcp4),
            "tcp6" => Ok(ListenerNetwork::Tcp6),
            other => Err(format!("unknown network {other:?} (expected tcp, tcp4 or tcp6)")),
        }
    }
}

/// OS signals that can trigger a graceful shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownSignal {
    /// SIGINT / Ctrl+C.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// SIGHUP.
    Hangup,
    /// SIGQUIT.
    Quit,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
            ShutdownSignal::Hangup => "SIGHUP",
            ShutdownSignal::Quit => "SIGQUIT",
        };
        f.write_str(name)
    }
}

/// Role of the current process with respect to prefork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessRole {
    #[default]
    Standalone,
    PreforkParent,
    PreforkChild,
}

impl ProcessRole {
    /// Read the role from the environment marker.
    pub fn detect() -> Self {
        match std::env::var(PREFORK_CHILD_ENV) {
            Ok(value) if value == "1" => ProcessRole::PreforkChild,
            _ => ProcessRole::Standalone,
        }
    }

    /// The role of this process, detected once and cached.
    pub fn current() -> Self {
        static ROLE: OnceLock<ProcessRole> = OnceLock::new();
        *ROLE.get_or_init(Self::detect)
    }

    pub fn is_prefork_child(&self) -> bool {
        matches!(self, ProcessRole::PreforkChild)
    }
}

/// Partially-specified startup configuration.
///
/// Zero values (`None`, empty paths, an empty signal list, a zero timeout)
/// mean "use the default".
#[derive(Clone, Default)]
pub struct StartConfig {
    /// Known networks are tcp, tcp4 (IPv4-only) and tcp6 (IPv6-only).
    /// Prefork accepts only tcp4 and tcp6.
    pub listener_network: Option<ListenerNetwork>,

    /// PEM certificate chain. TLS is enabled when this and `cert_key_file` are set.
    pub cert_file: Option<PathBuf>,

    /// PEM private key matching `cert_file`.
    pub cert_key_file: Option<PathBuf>,

    /// PEM bundle of client CAs. Enables mutual TLS.
    pub cert_client_file: Option<PathBuf>,

    /// Signals that trigger a graceful shutdown.
    pub graceful_signals: Vec<ShutdownSignal>,

    /// Upper bound on the drain before the process is forcibly exited.
    pub graceful_timeout: Duration,

    pub tls_config_hook: Option<TlsConfigHook>,
    pub listener_addr_hook: Option<ListenerAddrHook>,
    pub before_serve_hook: Option<BeforeServeHook>,

    /// Do not print the startup banner.
    pub disable_startup_message: bool,

    /// Spawn several processes sharing one listening port.
    pub enable_prefork: bool,

    /// Print the route table after the banner.
    pub enable_print_routes: bool,

    /// Number of prefork children. Defaults to one per available CPU.
    pub prefork_processes: Option<NonZeroUsize>,

    pub on_shutdown_error: Option<ShutdownErrorHook>,

    /// Prefork role of this process. Filled from the environment by
    /// `Server::start` when left unset.
    pub role: Option<ProcessRole>,
}

impl StartConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tls_config_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(Option<&mut rustls::ServerConfig>) + Send + Sync + 'static,
    {
        self.tls_config_hook = Some(Arc::new(hook));
        self
    }

    pub fn with_listener_addr_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(SocketAddr) + Send + Sync + 'static,
    {
        self.listener_addr_hook = Some(Arc::new(hook));
        self
    }

    pub fn with_before_serve_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&App) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.before_serve_hook = Some(Arc::new(hook));
        self
    }

    pub fn with_shutdown_error_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(ShutdownError) + Send + Sync + 'static,
    {
        self.on_shutdown_error = Some(Arc::new(hook));
        self
    }
}

/// Fully-resolved startup configuration. Immutable once built.
#[derive(Clone)]
pub struct ResolvedStartConfig {
    pub listener_network: ListenerNetwork,
    pub cert_file: Option<PathBuf>,
    pub cert_key_file: Option<PathBuf>,
    pub cert_client_file: Option<PathBuf>,
    pub graceful_signals: Vec<ShutdownSignal>,
    pub graceful_timeout: Duration,
    pub tls_config_hook: Option<TlsConfigHook>,
    pub listener_addr_hook: Option<ListenerAddrHook>,
    pub before_serve_hook: Option<BeforeServeHook>,
    pub disable_startup_message: bool,
    pub enable_prefork: bool,
    pub enable_print_routes: bool,
    pub prefork_processes: Option<NonZeroUsize>,
    pub on_shutdown_error: ShutdownErrorHook,
    pub role: ProcessRole,
}

impl ResolvedStartConfig {
    /// Certificate and key paths, when both are configured.
    pub fn tls_files(&self) -> Option<(&Path, &Path)> {
        match (&self.cert_file, &self.cert_key_file) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }

    pub fn is_tls(&self) -> bool {
        self.tls_files().is_some()
    }
}

impl From<ResolvedStartConfig> for StartConfig {
    fn from(resolved: ResolvedStartConfig) -> Self {
        Self {
            listener_network: Some(resolved.listener_network),
            cert_file: resolved.cert_file,
            cert_key_file: resolved.cert_key_file,
            cert_client_file: resolved.cert_client_file,
            graceful_signals: resolved.graceful_signals,
            graceful_timeout: resolved.graceful_timeout,
            tls_config_hook: resolved.tls_config_hook,
            listener_addr_hook: resolved.listener_addr_hook,
            before_serve_hook: resolved.before_serve_hook,
            disable_startup_message: resolved.disable_startup_message,
            enable_prefork: resolved.enable_prefork,
            enable_print_routes: resolved.enable_print_routes,
            prefork_processes: resolved.prefork_processes,
            on_shutdown_error: Some(resolved.on_shutdown_error),
            role: Some(resolved.role),
        }
    }
}

/// Merge a partial configuration with the defaults.
///
/// Pure and total: any zero-valued field is replaced by its default, every
/// other field passes through unchanged.
pub fn resolve(partial: Option<StartConfig>) -> ResolvedStartConfig {
    let cfg = partial.unwrap_or_default();

    ResolvedStartConfig {
        listener_network: cfg.listener_network.unwrap_or_default(),
        cert_file: non_empty(cfg.cert_file),
        cert_key_file: non_empty(cfg.cert_key_file),
        cert_client_file: non_empty(cfg.cert_client_file),
        graceful_signals: if cfg.graceful_signals.is_empty() {
            vec![ShutdownSignal::Interrupt]
        } else {
            cfg.graceful_signals
        },
        graceful_timeout: if cfg.graceful_timeout.is_zero() {
            DEFAULT_GRACEFUL_TIMEOUT
        } else {
            cfg.graceful_timeout
        },
        tls_config_hook: cfg.tls_config_hook,
        listener_addr_hook: cfg.listener_addr_hook,
        before_serve_hook: cfg.before_serve_hook,
        disable_startup_message: cfg.disable_startup_message,
        enable_prefork: cfg.enable_prefork,
        enable_print_routes: cfg.enable_print_routes,
        prefork_processes: cfg.prefork_processes,
        on_shutdown_error: cfg.on_shutdown_error.unwrap_or_else(default_shutdown_error_hook),
        role: cfg.role.unwrap_or_default(),
    }
}

fn non_empty(path: Option<PathBuf>) -> Option<PathBuf> {
    path.filter(|p| !p.as_os_str().is_empty())
}

fn default_shutdown_error_hook() -> ShutdownErrorHook {
    Arc::new(|err: ShutdownError| tracing::error!(error = %err, "Graceful shutdown failed"))
}

impl fmt::Debug for StartConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartConfig")
            .field("listener_network", &self.listener_network)
            .field("cert_file", &self.cert_file)
            .field("cert_key_file", &self.cert_key_file)
            .field("cert_client_file", &self.cert_client_file)
            .field("graceful_signals", &self.graceful_signals)
            .field("graceful_timeout", &self.graceful_timeout)
            .field("tls_config_hook", &self.tls_config_hook.is_some())
            .field("listener_addr_hook", &self.listener_addr_hook.is_some())
            .field("before_serve_hook", &self.before_serve_hook.is_some())
            .field("disable_startup_message", &self.disable_startup_message)
            .field("enable_prefork", &self.enable_prefork)
            .field("enable_print_routes", &self.enable_print_routes)
            .field("prefork_processes", &self.prefork_processes)
            .field("on_shutdown_error", &self.on_shutdown_error.is_some())
            .field("role", &self.role)
            .finish()
    }
}

impl fmt::Debug for ResolvedStartConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedStartConfig")
            .field("listener_network", &self.listener_network)
            .field("cert_file", &self.cert_file)
            .field("cert_key_file", &self.cert_key_file)
            .field("cert_client_file", &self.cert_client_file)
            .field("graceful_signals", &self.graceful_signals)
            .field("graceful_timeout", &self.graceful_timeout)
            .field("tls_config_hook", &self.tls_config_hook.is_some())
            .field("listener_addr_hook", &self.listener_addr_hook.is_some())
            .field("before_serve_hook", &self.before_serve_hook.is_some())
            .field("disable_startup_message", &self.disable_startup_message)
            .field("enable_prefork", &self.enable_prefork)
            .field("enable_print_routes", &self.enable_print_routes)
            .field("prefork_processes", &self.prefork_processes)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}
