// ABOUTME: Lightweight cooperative cancellation token shared across connect/read/write calls
// ABOUTME: Functionally equivalent to tokio_util's CancellationToken, kept local to avoid a new dependency

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A cloneable cancellation signal.
///
/// Cloning shares the same underlying flag: calling [`CancelToken::cancel`]
/// on any clone wakes every task currently awaiting
/// [`CancelToken::cancelled`], and every future call to `cancelled()`
/// returns immediately.
#[derive(Clone)]
pub struct CancelToken(Arc<Inner>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(Inner {
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        }))
    }

    /// A token that can never be cancelled. Convenient for call sites that
    /// don't need external cancellation (e.g. a single best-effort write).
    pub fn none() -> Self {
        Self::new()
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called (on any clone).
    /// Resolves immediately if it already has.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            let notified = self.0.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
            if self.is_cancelled() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
