//! HTTP server lifecycle: listener construction (plain, TLS, mutual TLS),
//! startup strategies (bind, supplied listener, prefork) and graceful shutdown.
//!
//! ```text
//! StartConfig ─► resolve ─► TLS assembly ─► bind / adopt / prefork
//!                                               │
//!                     hooks ◄─ dispatch tree ◄──┘
//!                       │
//!                       ▼
//!                  accept loop ◄── graceful shutdown controller (signals)
//! ```

// Core subsystems
pub mod config;
pub mod http;
pub mod net;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::{resolve, ListenerNetwork, ProcessRole, ResolvedStartConfig, ShutdownSignal, StartConfig};
pub use http::{App, DrainError, ServeError};
pub use lifecycle::{
    GracefulShutdown, HookKind, ListenTarget, PreforkCommand, PreforkError, Server, ShutdownError,
    ShutdownState, StartError,
};
pub use net::{build_listener, BoundListener, ListenerError, TlsError};
