//! Graceful shutdown coordination.
//!
//! Waits for a configured signal, then races the drain against the graceful
//! timeout. Whichever finishes first decides the exit code.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

use crate::config::{ResolvedStartConfig, ShutdownErrorHook, ShutdownSignal};
use crate::http::DrainError;
use crate::lifecycle::signals;

/// Progress of a graceful shutdown. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownState {
    Running,
    DrainRequested,
    Drained,
    TimedOut,
}

impl ShutdownState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ShutdownState::Drained | ShutdownState::TimedOut)
    }
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("shutdown timed out after {0:?}")]
    Timeout(Duration),

    #[error("drain failed: {0}")]
    Drain(#[from] DrainError),

    #[error("cannot install signal handlers: {0}")]
    Signal(#[source] std::io::Error),
}

/// Result of a drain/timeout race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownOutcome {
    pub state: ShutdownState,
    pub exit_code: i32,
}

impl ShutdownOutcome {
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }
}

/// Coordinator for graceful shutdown.
///
/// Publishes its [`ShutdownState`] on a watch channel.
pub struct GracefulShutdown {
    timeout: Duration,
    on_error: ShutdownErrorHook,
    state: watch::Sender<ShutdownState>,
}

impl GracefulShutdown {
    pub fn new(timeout: Duration, on_error: ShutdownErrorHook) -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self {
            timeout,
            on_error,
            state,
        }
    }

    pub fn from_config(config: &ResolvedStartConfig) -> Self {
        Self::new(config.graceful_timeout, config.on_shutdown_error.clone())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Subscribe to state changes.
    pub fn state(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    fn advance(&self, next: ShutdownState) {
        self.state.send_if_modified(|current| {
            if next > *current && !current.is_terminal() {
                *current = next;
                true
            } else {
                false
            }
        });
    }

    /// Race `drain` against the graceful timeout.
    ///
    /// The loser is dropped. `on_error` runs at most once.
    pub async fn race<F>(&self, drain: F) -> ShutdownOutcome
    where
        F: Future<Output = Result<(), DrainError>>,
    {
        self.advance(ShutdownState::DrainRequested);

        let (state, exit_code, error) = tokio::select! {
            result = drain => match result {
                Ok(()) => (ShutdownState::Drained, 0, None),
                Err(e) => (ShutdownState::Drained, 0, Some(ShutdownError::Drain(e))),
            },
            _ = tokio::time::sleep(self.timeout) => {
                (ShutdownState::TimedOut, 1, Some(ShutdownError::Timeout(self.timeout)))
            }
        };

        self.advance(state);
        if let Some(error) = error {
            (self.on_error)(error);
        }

        ShutdownOutcome { state, exit_code }
    }

    /// Log the trigger, then race the drain.
    pub async fn drive<F>(&self, trigger: ShutdownSignal, drain: F) -> ShutdownOutcome
    where
        F: Future<Output = Result<(), DrainError>>,
    {
        tracing::info!(
            signal = %trigger,
            timeout_ms = self.timeout.as_millis() as u64,
            "Shutdown signal received, draining"
        );

        let outcome = self.race(drain).await;

        match outcome.state {
            ShutdownState::TimedOut => tracing::warn!("Drain did not finish in time, forcing exit"),
            _ => tracing::info!("Shutdown complete"),
        }
        outcome
    }

    /// Wait for one of `signals`, drain, and terminate the process.
    ///
    /// Returns without terminating only when signal handlers cannot be installed.
    pub async fn run<F, Fut>(self, signals: Vec<ShutdownSignal>, drain: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), DrainError>>,
    {
        let trigger = match signals::wait_for_any(&signals).await {
            Ok(trigger) => trigger,
            Err(e) => {
                (self.on_error)(ShutdownError::Signal(e));
                return;
            }
        };

        let outcome = self.drive(trigger, drain()).await;
        std::process::exit(outcome.exit_code());
    }
}

impl std::fmt::Debug for GracefulShutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GracefulShutdown")
            .field("timeout", &self.timeout)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recording_hook() -> (ShutdownErrorHook, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let hook: ShutdownErrorHook = Arc::new(move |err| sink.lock().unwrap().push(err.to_string()));
        (hook, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn fast_drain_exits_zero() {
        let (hook, seen) = recording_hook();
        let controller = GracefulShutdown::new(Duration::from_secs(10), hook);
        let state = controller.state();

        let outcome = controller
            .race(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;

        assert_eq!(outcome.state, ShutdownState::Drained);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(*state.borrow(), ShutdownState::Drained);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_drain_times_out_once() {
        let (hook, seen) = recording_hook();
        let controller = GracefulShutdown::new(Duration::from_secs(2), hook);

        let outcome = controller.race(std::future::pending()).await;

        assert_eq!(outcome.state, ShutdownState::TimedOut);
        assert_eq!(outcome.exit_code(), 1);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_drain_reports_error_with_exit_zero() {
        let (hook, seen) = recording_hook();
        let controller = GracefulShutdown::new(Duration::from_secs(2), hook);

        let outcome = controller.race(async { Err(DrainError::NotServing) }).await;

        assert_eq!(outcome.state, ShutdownState::Drained);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn state_moves_forward_only() {
        let (hook, _) = recording_hook();
        let controller = GracefulShutdown::new(Duration::from_secs(1), hook);
        let mut state = controller.state();
        assert_eq!(*state.borrow_and_update(), ShutdownState::Running);

        controller.race(std::future::pending()).await;
        assert_eq!(*state.borrow_and_update(), ShutdownState::TimedOut);

        controller.advance(ShutdownState::Drained);
        controller.advance(ShutdownState::Running);
        assert_eq!(*state.borrow(), ShutdownState::TimedOut);
        assert!(!state.has_changed().unwrap());
    }
}
