//! Waitable boolean flag for cooperative shutdown and batch switching.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// A clonable set/clear/wait signal shared across threads.
///
/// Clone is cheap and shares state. All loops in the system poll one
/// of these at their blocking points so that shutdown and batch
/// switches are observed promptly.
#[derive(Debug, Clone, Default)]
pub struct Event {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    fn flag(&self) -> MutexGuard<'_, bool> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raise the flag and wake all waiters.
    pub fn set(&self) {
        *self.flag() = true;
        self.inner.1.notify_all();
    }

    /// Lower the flag. Waiters already woken stay woken.
    pub fn clear(&self) {
        *self.flag() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.flag()
    }

    /// Block until the flag is set or `timeout` elapses.
    ///
    /// Returns true when the flag is set, false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flag = self.flag();
        while !*flag {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self
                .inner
                .1
                .wait_timeout(flag, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            flag = guard;
            if result.timed_out() && !*flag {
                return false;
            }
        }
        true
    }
}
