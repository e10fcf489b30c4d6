//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured tracing events, filtered by RUST_LOG)
//!
//! Startup produces:
//!     → diagnostics.rs (banner + route table on stdout)
//! ```
//!
//! # Design Decisions
//! - Logs go through tracing; only the banner writes to stdout directly
//! - Colour is decided once per banner from the terminal and environment
//! - Prefork children stay quiet so the parent's banner is the only one

pub mod diagnostics;
pub mod logging;
