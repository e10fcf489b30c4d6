//! OS signal handling.
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - All configured signals are installed up front, then awaited together

use std::io;

use crate::config::ShutdownSignal;

/// Wait until any of `signals` is delivered and return which one.
///
/// Pends forever when `signals` is empty. Fails only if a handler cannot be
/// installed.
#[cfg(unix)]
pub async fn wait_for_any(signals: &[ShutdownSignal]) -> io::Result<ShutdownSignal> {
    use futures_util::future::{select_all, FutureExt};
    use tokio::signal::unix::{signal, SignalKind};

    let mut streams = Vec::with_capacity(signals.len());
    for &which in signals {
        let kind = match which {
            ShutdownSignal::Interrupt => SignalKind::interrupt(),
            ShutdownSignal::Terminate => SignalKind::terminate(),
            ShutdownSignal::Hangup => SignalKind::hangup(),
            ShutdownSignal::Quit => SignalKind::quit(),
        };
        streams.push((which, signal(kind)?));
    }

    if streams.is_empty() {
        return std::future::pending().await;
    }

    tracing::debug!(signals = ?signals, "Waiting for shutdown signal");

    let waits = streams
        .iter_mut()
        .map(|(which, stream)| {
            let which = *which;
            async move {
                stream.recv().await;
                which
            }
            .boxed()
        })
        .collect::<Vec<_>>();

    let (received, _, _) = select_all(waits).await;
    Ok(received)
}

/// Only Ctrl+C is observable off unix; it stands in for every configured signal.
#[cfg(not(unix))]
pub async fn wait_for_any(signals: &[ShutdownSignal]) -> io::Result<ShutdownSignal> {
    if signals.is_empty() {
        return std::future::pending().await;
    }
    tokio::signal::ctrl_c().await?;
    Ok(ShutdownSignal::Interrupt)
}
