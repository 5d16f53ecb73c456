//! Cooperative cancellation tokens
//!
//! **Why**: Animation jobs can span many frames. Cancellation must be
//! cooperative - the owner flips a shared flag and the job observes it at its
//! next step. Nothing here force-terminates in-flight work.
//!
//! **Used by**: queue (per-job abort), callers that poll `CancelToken`

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
}

/// Owning side of a cancellation pair. Dropping the source does NOT cancel.
#[derive(Debug, Clone, Default)]
pub struct CancelSource {
    inner: Arc<CancelInner>,
}

/// Observing side, cheap to clone and hand to running work.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token observing this source.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }
}
