//! Cooperative cancellation token shared across the engine's tasks.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Clones share one underlying flag; cancelling any clone wakes all waiters.
#[derive(Debug, Default, Clone)]
pub struct SignalOfStop {
    internal: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    notify: Notify,
}

impl SignalOfStop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.internal.closing.store(true, Ordering::Release);
        self.internal.notify.notify_waiters();
    }

    pub fn cancelled(&self) -> bool {
        self.internal.closing.load(Ordering::Acquire)
    }

    /// Resolve when cancellation is signaled; immediately if it already was.
    pub async fn wait(&self) {
        while !self.cancelled() {
            let notified = self.internal.notify.notified();
            if self.cancelled() {
                break;
            }
            notified.await;
        }
    }

    /// Race a future against cancellation: `Ok` if it finishes first,
    /// `Err(())` if the engine is shutting down.
    pub async fn select<F, T>(&self, fut: F) -> Result<T, ()>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            res = fut => Ok(res),
            _ = self.wait() => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let sos = SignalOfStop::new();
        let waiter = sos.clone();
        let task = tokio::spawn(async move {
            waiter.wait().await;
            true
        });
        sos.cancel();
        assert!(task.await.unwrap());
        assert!(sos.cancelled());
    }

    #[tokio::test]
    async fn select_prefers_completed_future() {
        let sos = SignalOfStop::new();
        let out = sos.select(async { 7 }).await;
        assert_eq!(out, Ok(7));

        sos.cancel();
        let out = sos.select(std::future::pending::<i32>()).await;
        assert_eq!(out, Err(()));
    }
}
