//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! StartConfig (network, cert files, hooks)
//!     → tls.rs (load key pair, client CAs, TLS hook)
//!     → listener.rs (resolve address, bind via socket2, pair with TLS acceptor)
//!     → BoundListener handed to the accept loop
//!
//! Per accepted connection:
//!     → optional TLS handshake (mTLS rejects here)
//!     → connection.rs (tracked until closed)
//! ```
//!
//! # Design Decisions
//! - Never fall back to plaintext when TLS files are configured
//! - The socket is owned by the accept loop; others only hold a closer
//! - Closing is observable by a concurrent accept

pub mod connection;
pub mod listener;
pub mod tls;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{AcceptError, BindOptions, BoundListener, CloseSignal, ListenerCloser, ListenerError};
pub use tls::TlsError;

use crate::config::ResolvedStartConfig;
use crate::lifecycle::startup::StartError;

/// Build a listener for `addr`: load TLS material, apply the TLS hook, bind,
/// and report the bound address to the address hook.
pub async fn build_listener(
    addr: &str,
    config: &ResolvedStartConfig,
) -> Result<BoundListener, StartError> {
    let tls = tls::assemble(config)?;
    let options = BindOptions {
        reuse_port: config.role.is_prefork_child(),
    };
    Ok(listener::bind(addr, config, tls, options).await?)
}
