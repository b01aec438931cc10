//! Cooperative cancellation primitive for the connection task.
//!
//! A thread-safe, async-aware token that can be cloned across tasks,
//! awaited for cancellation, and used in `select!` to abort futures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A cooperative cancellation token.
///
/// Clones share the same underlying state, so cancelling any clone
/// notifies all waiters.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    internal: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    /// Create a new, uncancelled signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to all waiters.
    ///
    /// After this call, `cancelled()` returns `true` and all pending
    /// `wait()` futures complete.
    pub fn cancel(&self) {
        self.internal.closing.store(true, Ordering::Release);
        self.internal.notify.notify_waiters();
    }

    /// Check if cancellation has been signaled.
    pub fn cancelled(&self) -> bool {
        self.internal.closing.load(Ordering::Acquire)
    }

    /// Wait for cancellation to be signaled.
    ///
    /// Returns immediately if already cancelled.
    pub async fn wait(&self) {
        let notified = self.internal.notify.notified();
        tokio::pin!(notified);
        // Register before the flag check so a cancel() racing this call
        // cannot slip between check and await.
        notified.as_mut().enable();
        if self.cancelled() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let stop = StopSignal::new();
        assert!(!stop.cancelled());

        let waiter = stop.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        stop.cancel();
        handle.await.unwrap();
        assert!(stop.cancelled());
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_cancelled() {
        let stop = StopSignal::new();
        stop.cancel();
        stop.wait().await;
    }
}
