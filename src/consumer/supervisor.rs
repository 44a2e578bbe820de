//! Cancellation signal and task ownership for dispatch loops.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Bound on how long shutdown waits for loops to exit.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors during shutdown. Logged by callers; shutdown always proceeds.
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("{remaining} subscription loop(s) still running after {timeout:?}, aborted")]
    DrainTimeout { timeout: Duration, remaining: usize },
}

/// Owns the shared cancellation signal and every spawned loop.
pub struct Supervisor {
    cancel: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            cancel,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Signal every loop to stop. Returns `true` only on the first call.
    pub fn cancel(&self) -> bool {
        self.cancel.send_if_modified(|cancelled| {
            if *cancelled {
                false
            } else {
                *cancelled = true;
                true
            }
        })
    }

    /// Spawn a loop that receives the cancellation signal.
    ///
    /// Returns `false` without spawning once cancelled.
    pub async fn spawn<F, Fut>(&self, make: F) -> bool
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        if self.is_cancelled() {
            return false;
        }
        tasks.spawn(make(self.cancel.subscribe()));
        true
    }

    /// Loops spawned and not yet reaped.
    pub async fn running(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Wait for every loop to finish, aborting stragglers after `timeout`.
    pub async fn drain(&self, timeout: Duration) -> Result<(), ShutdownError> {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);

        let joined = tokio::time::timeout(timeout, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    if e.is_panic() {
                        error!(error = %e, "Subscription loop panicked");
                    }
                }
            }
        })
        .await;

        match joined {
            Ok(()) => {
                debug!("All subscription loops stopped");
                Ok(())
            }
            Err(_) => {
                let remaining = tasks.len();
                tasks.abort_all();
                Err(ShutdownError::DrainTimeout { timeout, remaining })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_reaches_loops() {
        let supervisor = Supervisor::new();
        for _ in 0..3 {
            supervisor
                .spawn(|mut cancel| async move {
                    while !*cancel.borrow() {
                        if cancel.changed().await.is_err() {
                            break;
                        }
                    }
                })
                .await;
        }
        assert_eq!(supervisor.running().await, 3);

        assert!(supervisor.cancel());
        assert!(!supervisor.cancel());
        supervisor.drain(Duration::from_secs(1)).await.unwrap();
        assert_eq!(supervisor.running().await, 0);
    }

    #[tokio::test]
    async fn test_spawn_after_cancel_is_refused() {
        let supervisor = Supervisor::new();
        supervisor.cancel();
        let spawned = supervisor.spawn(|_| async {}).await;
        assert!(!spawned);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out_and_aborts() {
        let supervisor = Supervisor::new();
        supervisor
            .spawn(|_| std::future::pending::<()>())
            .await;
        supervisor.cancel();

        let result = supervisor.drain(DRAIN_TIMEOUT).await;

        assert!(matches!(
            result,
            Err(ShutdownError::DrainTimeout { remaining: 1, .. })
        ));
    }
}
