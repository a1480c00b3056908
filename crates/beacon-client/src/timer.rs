//! Resettable backoff timer.
//!
//! A policy object: it schedules a single pending invocation of its callback
//! after a try-count-dependent delay. It makes no precision guarantee beyond
//! the runtime's own timers.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

struct TimerInner {
    callback: Box<dyn Fn() + Send + Sync>,
    timer_calc: Box<dyn Fn(u32) -> Duration + Send + Sync>,
    tries: AtomicU32,
    pending: Mutex<Option<JoinHandle<()>>>,
}

/// A resettable timer whose delay escalates with the number of tries since
/// the last reset.
///
/// `schedule_timeout` cancels any pending invocation and schedules exactly
/// one future invocation after `timer_calc(tries + 1)`. Firing increments
/// `tries` before running the callback. `reset` cancels any pending
/// invocation and zeroes the try counter.
#[derive(Clone)]
pub struct BackoffTimer {
    inner: Arc<TimerInner>,
}

impl BackoffTimer {
    /// Create a new timer.
    ///
    /// Requires a tokio runtime to be active when `schedule_timeout` is
    /// called.
    pub fn new(
        callback: impl Fn() + Send + Sync + 'static,
        timer_calc: impl Fn(u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                callback: Box::new(callback),
                timer_calc: Box::new(timer_calc),
                tries: AtomicU32::new(0),
                pending: Mutex::new(None),
            }),
        }
    }

    /// Cancel any pending invocation and zero the try counter.
    pub fn reset(&self) {
        self.inner.tries.store(0, Ordering::SeqCst);
        if let Some(handle) = self
            .inner
            .pending
            .lock()
            .expect("timer lock poisoned")
            .take()
        {
            handle.abort();
        }
    }

    /// Cancel any pending invocation and schedule exactly one future
    /// invocation of the callback.
    pub fn schedule_timeout(&self) {
        let mut pending = self.inner.pending.lock().expect("timer lock poisoned");
        if let Some(handle) = pending.take() {
            handle.abort();
        }

        let tries = self.inner.tries.load(Ordering::SeqCst);
        let delay = (self.inner.timer_calc)(tries + 1);
        let inner = Arc::clone(&self.inner);
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.tries.fetch_add(1, Ordering::SeqCst);
            (inner.callback)();
        }));
    }

    /// Number of invocations since the last reset.
    #[must_use]
    pub fn tries(&self) -> u32 {
        self.inner.tries.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for BackoffTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackoffTimer")
            .field("tries", &self.tries())
            .finish_non_exhaustive()
    }
}
