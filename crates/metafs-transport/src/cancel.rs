//! Cooperative cancellation for in-flight requests.
//!
//! A connection (or a test) owns the [`CancelHandle`]; every request that
//! arrives on it carries a cloned [`CancelToken`]. The bulk transfer wait
//! selects on [`CancelToken::cancelled`] so a vanished peer interrupts the
//! worker instead of parking it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Why a token was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    /// The peer connection went away.
    ClientDisconnected,
    /// The service is shutting down.
    ServerShutdown,
    /// Explicit interruption.
    #[default]
    UserRequested,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::ClientDisconnected => write!(f, "ClientDisconnected"),
            CancelReason::ServerShutdown => write!(f, "ServerShutdown"),
            CancelReason::UserRequested => write!(f, "UserRequested"),
        }
    }
}

struct CancelState {
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    notify: Notify,
}

/// Cloneable listening side of a cancellation pair.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    /// A token whose handle has been dropped; it never fires.
    pub fn never() -> Self {
        new_cancel_pair().0
    }

    /// Returns true once the paired handle has fired.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Reason given by the handle, if it fired.
    pub fn cancelled_reason(&self) -> Option<CancelReason> {
        self.state.reason.lock().ok().and_then(|r| *r)
    }

    /// Resolves when the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Firing side of a cancellation pair.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    /// Cancels every token of the pair. The first reason wins.
    pub fn cancel(&self, reason: CancelReason) {
        if let Ok(mut r) = self.state.reason.lock() {
            if r.is_none() {
                *r = Some(reason);
            }
        }
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    /// Returns true if cancel has been called.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }
}

/// Creates a new token/handle pair.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let state = Arc::new(CancelState {
        cancelled: AtomicBool::new(false),
        reason: Mutex::new(None),
        notify: Notify::new(),
    });
    (
        CancelToken {
            state: state.clone(),
        },
        CancelHandle { state },
    )
}
