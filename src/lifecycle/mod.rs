//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     resolve config → assemble TLS → bind / adopt / prefork
//!     → on-listen hooks → dispatch tree → banner → before-serve hook
//!     → accept loop (+ shutdown controller, + parent watcher in children)
//!
//! Prefork (prefork.rs):
//!     parent: spawn N children → wait → first failure terminates the rest
//!     child:  SO_REUSEPORT bind → normal accept loop
//!
//! Shutdown (shutdown.rs, signals.rs):
//!     signal → DrainRequested → drain vs timeout → Drained (0) | TimedOut (1) → exit
//! ```
//!
//! # Design Decisions
//! - Ordered startup: nothing accepts before hooks and the tree are ready
//! - Ordered shutdown: stop accept, drain, exit
//! - Shutdown has timeout: forced exit after deadline

pub mod prefork;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use prefork::{ChildProcessSet, PreforkCommand, PreforkError, PreforkTarget};
pub use shutdown::{GracefulShutdown, ShutdownError, ShutdownOutcome, ShutdownState};
pub use startup::{HookKind, ListenTarget, Server, StartError};
