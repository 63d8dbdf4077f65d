//! Termination Handling
//!
//! Provides the terminate flag shared by a replication thread and all of
//! its node routines, plus process signal handling for the binary.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Terminate coordinator for a replication thread.
///
/// Setting the flag wakes every task blocked in [`Terminator::wait`] or
/// [`Terminator::sleep`]. The flag can be reset so the owner may run again.
#[derive(Clone)]
pub struct Terminator {
    /// Current flag value, observed by waiters
    flag: Arc<watch::Sender<bool>>,
    /// Number of node routines still running
    active_routines: Arc<AtomicUsize>,
}

impl Terminator {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
            active_routines: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Set or reset the terminate flag.
    pub fn set(&self, value: bool) {
        let prev = self.flag.send_replace(value);
        if value && !prev {
            tracing::debug!("terminate flag was set");
        }
    }

    pub fn is_set(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolve once the flag is set.
    pub async fn wait(&self) {
        let mut rx = self.flag.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `duration` unless terminated first.
    ///
    /// Returns `false` when the sleep was cut short by termination.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_set() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_set(),
            _ = self.wait() => false,
        }
    }

    pub fn active_routines(&self) -> usize {
        self.active_routines.load(Ordering::SeqCst)
    }

    /// Track a running routine until the guard is dropped.
    pub fn routine_guard(&self) -> RoutineGuard {
        self.active_routines.fetch_add(1, Ordering::SeqCst);
        RoutineGuard {
            terminator: self.clone(),
        }
    }

    fn routine_ended(&self) {
        self.active_routines.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for Terminator {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for a running node routine.
pub struct RoutineGuard {
    terminator: Terminator,
}

impl Drop for RoutineGuard {
    fn drop(&mut self) {
        self.terminator.routine_ended();
    }
}

/// Install signal handlers for graceful shutdown.
///
/// Returns a future that completes when a shutdown signal is received.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, initiating shutdown");
        }
    }
}
