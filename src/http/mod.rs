//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! App (routes, hooks)
//!     → app.rs (build_tree: axum Router + TraceLayer, built once)
//!     → server.rs (accept loop over a BoundListener)
//!     → per connection: TLS handshake → hyper auto (HTTP/1.1, HTTP/2) → Router
//! ```

pub mod app;
pub mod server;

pub use app::{App, RouteInfo};
pub use server::{serve, DrainError, ServeError, ServeHandle};
