// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cooperative cancellation for run drivers.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Why a run was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// A user requested cancellation.
    UserRequested,
    /// The process is shutting down.
    Shutdown,
}

struct Shared {
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    notify: Notify,
}

/// Cloneable cancellation signal shared between a driver and its owner.
///
/// Cancelling is idempotent; only the first reason is kept.
#[derive(Clone)]
pub struct CancelSignal {
    shared: Arc<Shared>,
}

impl CancelSignal {
    /// Create a signal that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                cancelled: AtomicBool::new(false),
                reason: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Request cancellation. Later calls keep the first reason.
    pub fn cancel(&self, reason: CancelReason) {
        {
            let mut guard = self.shared.reason.lock().expect("cancel reason poisoned");
            if guard.is_none() {
                *guard = Some(reason);
            }
        }
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    /// Returns `true` once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// The recorded reason, if cancelled.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        *self.shared.reason.lock().expect("cancel reason poisoned")
    }

    /// Completes when cancellation is requested (immediately if it already
    /// was).
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            self.shared.notify.notified().await;
            if self.is_cancelled() {
                return;
            }
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}
