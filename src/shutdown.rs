use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::errors::IntakeError;

/// Owns the cancellation flag for sagas, loops and the dripper.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    tx: watch::Sender<bool>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn trigger(&self) {
        info!("Shutdown requested; no new steps will be started");
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Trigger shutdown on SIGINT/Ctrl-C.
    pub fn install_signal_handlers(&self) -> JoinHandle<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupt received, shutting down gracefully");
                    tx.send_replace(true);
                }
                Err(e) => warn!("Failed to listen for interrupt signal: {}", e),
            }
        })
    }
}

/// Cheap, cloneable view of a [`ShutdownCoordinator`].
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// A signal with no coordinator behind it; it never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    pub fn check(&self) -> Result<(), IntakeError> {
        if self.is_triggered() {
            Err(IntakeError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once shutdown is requested.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|stopped| *stopped).await.is_err() {
            // Coordinator dropped without triggering.
            std::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration` unless shutdown arrives first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), IntakeError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.triggered() => Err(IntakeError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted_by_trigger() {
        let coordinator = ShutdownCoordinator::new();
        let signal = coordinator.signal();

        let sleeper = tokio::spawn(async move { signal.sleep(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        coordinator.trigger();

        let result = sleeper.await.unwrap();
        assert!(matches!(result, Err(IntakeError::Cancelled)));
        assert!(coordinator.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_signal_lets_sleep_finish() {
        let signal = ShutdownSignal::never();
        signal.sleep(Duration::from_secs(1)).await.unwrap();
        assert!(signal.check().is_ok());
    }
}
