//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! settings file (TOML)          code (hooks, overrides)
//!     → loader.rs                    │
//!     → validation.rs                │
//!     → StartSettings ──────────► StartConfig (partial)
//!                                    → schema::resolve
//!                                    → ResolvedStartConfig (immutable)
//!                                    → cloned into every task
//! ```
//!
//! # Design Decisions
//! - Resolution is total: every zero value has a default, so it cannot fail
//! - Hooks are explicit function values and never come from files
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_settings, ConfigError, StartSettings};
pub use schema::{
    resolve, BeforeServeHook, BoxError, ListenerAddrHook, ListenerNetwork, ProcessRole,
    ResolvedStartConfig, ShutdownErrorHook, ShutdownSignal, StartConfig, TlsConfigHook,
    DEFAULT_GRACEFUL_TIMEOUT, PREFORK_CHILD_ENV,
};
