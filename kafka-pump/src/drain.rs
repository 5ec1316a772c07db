use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainError {
    #[error("the pump is draining and no longer accepts new receive contexts")]
    Draining,
}

/// Counted barrier between the pump and its outstanding receive contexts.
///
/// The count starts at one, a bias standing for the poll loop itself. Every
/// receive context adds one while it is active. `begin_drain` releases the bias
/// and waits for the count to reach zero.
pub struct DrainCoordinator {
    outstanding: AtomicUsize,
    draining: AtomicBool,
    drained: Notify,
}

impl Default for DrainCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl DrainCoordinator {
    pub fn new() -> Self {
        Self {
            outstanding: AtomicUsize::new(1),
            draining: AtomicBool::new(false),
            drained: Notify::new(),
        }
    }

    /// Register one more outstanding unit of work.
    pub fn increment(&self) -> Result<(), DrainError> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(DrainError::Draining);
        }

        // A count of zero means the barrier already released: never resurrect it.
        self.outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| DrainError::Draining)
    }

    pub fn decrement(&self) {
        match self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(1) => {
                debug!("drain barrier reached zero");
                self.drained.notify_waiters();
            }
            Ok(_) => {}
            Err(_) => error!("drain counter decremented below zero"),
        }
    }

    /// Increment and hand back a guard that decrements when dropped.
    pub fn enter(self: &Arc<Self>) -> Result<DrainToken, DrainError> {
        self.increment()?;
        Ok(DrainToken {
            coordinator: self.clone(),
        })
    }

    /// Release the poll loop's bias and wait until every outstanding unit has
    /// finished. Returns false if the timeout elapsed first. Calling it again
    /// only waits, the bias is released once.
    pub async fn begin_drain(&self, timeout: Duration) -> bool {
        if !self.draining.swap(true, Ordering::SeqCst) {
            self.decrement();
        }

        let wait_for_zero = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.outstanding.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };

        match tokio::time::timeout(timeout, wait_for_zero).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    outstanding = self.outstanding.load(Ordering::SeqCst),
                    timeout_ms = timeout.as_millis() as u64,
                    "drain timed out with receive contexts still outstanding"
                );
                false
            }
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Outstanding count, including the bias while the pump has not started draining.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

/// Holds one unit of the drain count; decrements exactly once when dropped.
pub struct DrainToken {
    coordinator: Arc<DrainCoordinator>,
}

impl Drop for DrainToken {
    fn drop(&mut self) {
        self.coordinator.decrement();
    }
}
