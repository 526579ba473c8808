use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Condvar, Mutex,
};
use std::time::Duration;

use crate::{CloudArcError, Result};

/// Cooperative cancellation token shared by every pipeline stage.
///
/// The flag is set once and never cleared. Stages consult it at their
/// suspension points; retry sleeps wait on the condvar so cancellation
/// interrupts them immediately instead of after the full backoff delay.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    cancelled: AtomicBool,
    notify: (Mutex<()>, Condvar),
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                notify: (Mutex::new(()), Condvar::new()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        let (lock, cvar) = &self.inner.notify;
        let _guard = lock.lock().unwrap();
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Returns `Err(Cancelled)` once the token has been triggered.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CloudArcError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps for `duration` unless cancellation fires first. Returns
    /// `true` when the full duration elapsed, `false` on cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let (lock, cvar) = &self.inner.notify;
        let guard = lock.lock().unwrap();
        if self.is_cancelled() {
            return false;
        }
        let (_guard, result) = cvar
            .wait_timeout_while(guard, duration, |_| !self.is_cancelled())
            .unwrap();
        result.timed_out()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
