//! Thread-safe, one-shot cancellation token.
//!
//! Single writer (whoever calls `request_cancel`), any number of readers.
//! The flag itself is an atomic with release/acquire ordering; the mutex
//! only guards the callback list.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::TaskError;

type Callback = Box<dyn FnOnce() + Send>;

/// One-shot cancellation token shared by all tasks of a workflow.
///
/// Stages observe it cooperatively:
///
/// ```
/// # use storyloom_core::cancel::CancelToken;
/// # use storyloom_core::error::TaskError;
/// # fn work() -> Result<(), TaskError> {
/// # let token = CancelToken::new();
/// for _ in 0..10 {
///     token.check_canceled()?;
///     // ... do one unit of work ...
/// }
/// # Ok(()) }
/// ```
#[derive(Default)]
pub struct CancelToken {
    canceled: AtomicBool,
    callbacks: Mutex<Vec<Callback>>,
}

impl CancelToken {
    /// Create a shared token.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Request cancellation. Thread-safe and idempotent: the callbacks run
    /// exactly once, on the thread that first flips the flag.
    pub fn request_cancel(&self) {
        if self
            .canceled
            .compare_exchange(false, true, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        for cb in callbacks {
            // Cancellation must never itself fail.
            let _ = panic::catch_unwind(AssertUnwindSafe(cb));
        }
    }

    /// Check whether cancellation has been requested.
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Return `Err(TaskError::canceled())` if cancellation was requested.
    /// Call this at checkpoint positions in stage execution.
    pub fn check_canceled(&self) -> Result<(), TaskError> {
        if self.is_canceled() {
            Err(TaskError::canceled())
        } else {
            Ok(())
        }
    }

    /// Register a callback to run when cancellation is requested.
    /// Registering after cancellation invokes the callback immediately.
    pub fn on_cancel(&self, cb: impl FnOnce() + Send + 'static) {
        if self.is_canceled() {
            let _ = panic::catch_unwind(AssertUnwindSafe(cb));
            return;
        }

        let mut callbacks = self.callbacks.lock();
        // Re-check under the lock: request_cancel may have drained the list
        // between the flag read and the lock acquisition.
        if self.is_canceled() {
            drop(callbacks);
            let _ = panic::catch_unwind(AssertUnwindSafe(cb));
            return;
        }
        callbacks.push(Box::new(cb));
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("canceled", &self.is_canceled())
            .finish_non_exhaustive()
    }
}
