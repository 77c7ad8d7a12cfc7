//! Graceful shutdown handling
//!
//! Provides signal handling and a shared flag the scheduler and worker loops
//! select on. Waiters that subscribe after the request still observe it.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Shutdown coordinator for graceful termination
#[derive(Clone)]
pub struct ShutdownCoordinator {
    requested: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("shutdown_requested", &self.is_shutdown_requested())
            .finish()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { requested: Arc::new(tx) }
    }

    /// Request shutdown; later calls are no-ops
    pub fn request_shutdown(&self) {
        if !self.requested.send_replace(true) {
            info!("Shutdown requested");
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.requested.borrow()
    }

    /// Resolve once shutdown has been requested
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.requested.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|requested| *requested).await;
    }

    /// Install handlers for SIGINT and SIGTERM that request shutdown
    pub fn install_signal_handlers(&self) -> tokio::task::JoinHandle<()> {
        let coordinator = self.clone();

        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};

                let (mut sigint, mut sigterm) = match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                    (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
                    (Err(e), _) | (_, Err(e)) => {
                        error!(error = %e, "Failed to install signal handlers");
                        return;
                    }
                };

                tokio::select! {
                    _ = sigint.recv() => warn!("Received SIGINT, initiating graceful shutdown..."),
                    _ = sigterm.recv() => warn!("Received SIGTERM, initiating graceful shutdown..."),
                }
                coordinator.request_shutdown();
            }

            #[cfg(not(unix))]
            {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "Failed to install Ctrl+C handler");
                    return;
                }
                warn!("Received Ctrl+C, initiating graceful shutdown...");
                coordinator.request_shutdown();
            }
        })
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_request_shutdown_is_idempotent() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_shutdown_requested());

        coordinator.request_shutdown();
        coordinator.request_shutdown();
        assert!(coordinator.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_wait_for_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.wait_for_shutdown().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        coordinator.request_shutdown();

        let result = tokio::time::timeout(Duration::from_millis(200), waiter).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_late_waiter_sees_earlier_request() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.request_shutdown();

        let result = tokio::time::timeout(Duration::from_millis(100), coordinator.wait_for_shutdown()).await;
        assert!(result.is_ok());
    }
}
