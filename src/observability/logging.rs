//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the global tracing subscriber once per process
//! - Take the filter from `RUST_LOG`, falling back to a crate default
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - Initialization is fallible instead of panicking when a subscriber exists

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "server_lifecycle=info,tower_http=info";

/// Install the global subscriber.
pub fn init(default_filter: &str) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
}
