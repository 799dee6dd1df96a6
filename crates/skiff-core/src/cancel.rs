//! Per-request cancellation.
//!
//! One `CancellationSignal` exists per in-flight request: single-writer
//! (the coordinator), multi-reader, set-once. It is observed cooperatively
//! at natural suspension points — between streamed chunks, between filter
//! invocations, between workflow nodes — never preemptively. A blocking
//! external call already in flight is abandoned, not killed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

/// Why a request was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The caller aborted (connection drop or explicit abort call).
    CallerAbort,
    /// The gateway is shutting down.
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::CallerAbort => write!(f, "caller abort"),
            CancelReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Writer half. Held by the coordinator; setting is idempotent and a set
/// signal is never reset.
#[derive(Clone)]
pub struct CancellationHandle {
    tx: Arc<watch::Sender<Option<CancelReason>>>,
}

impl CancellationHandle {
    /// Set the signal. The first reason wins; later calls are no-ops.
    pub fn cancel(&self, reason: CancelReason) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn signal(&self) -> CancellationSignal {
        CancellationSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Reader half. Cheap to clone; one per component that needs to observe.
#[derive(Clone)]
pub struct CancellationSignal {
    rx: watch::Receiver<Option<CancelReason>>,
}

impl CancellationSignal {
    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.rx.borrow()
    }

    /// Wait until the signal is set. Used inside `tokio::select!` arms at
    /// suspension points.
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.rx.clone();
        loop {
            if let Some(reason) = *rx.borrow() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Writer dropped without cancelling; park forever so select!
                // arms fall through to the producing branch.
                std::future::pending::<()>().await;
            }
        }
    }

    /// A signal that can never fire. For nested or test contexts that need
    /// a signal but have no coordinator.
    pub fn never() -> Self {
        static NEVER: once_cell::sync::Lazy<CancellationHandle> =
            once_cell::sync::Lazy::new(|| cancellation().0);
        NEVER.signal()
    }
}

/// Create an unregistered signal pair.
pub fn cancellation() -> (CancellationHandle, CancellationSignal) {
    let (tx, rx) = watch::channel(None);
    (
        CancellationHandle { tx: Arc::new(tx) },
        CancellationSignal { rx },
    )
}

/// Tracks in-flight requests so caller-side aborts can reach them.
///
/// Keys are `(chat_id, message_id)` — the same identity the persisted turn
/// uses, so an abort request needs nothing more than what the caller
/// already has.
#[derive(Default)]
pub struct CancellationCoordinator {
    inflight: Mutex<HashMap<(String, String), CancellationHandle>>,
}

impl CancellationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and get its signal. Replaces any stale entry for
    /// the same ids (exactly one handler runs per message id at a time).
    pub fn register(&self, chat_id: &str, message_id: &str) -> CancellationSignal {
        let (handle, signal) = cancellation();
        self.inflight
            .lock()
            .insert((chat_id.to_string(), message_id.to_string()), handle);
        signal
    }

    /// Fire the signal for an in-flight request. Returns false if the
    /// request is unknown (already finished or never started).
    pub fn cancel(&self, chat_id: &str, message_id: &str, reason: CancelReason) -> bool {
        let inflight = self.inflight.lock();
        match inflight.get(&(chat_id.to_string(), message_id.to_string())) {
            Some(handle) => {
                handle.cancel(reason);
                true
            }
            None => false,
        }
    }

    /// Deregister once the request reached a terminal state.
    pub fn complete(&self, chat_id: &str, message_id: &str) {
        self.inflight
            .lock()
            .remove(&(chat_id.to_string(), message_id.to_string()));
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().len()
    }
}
