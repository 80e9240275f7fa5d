//! Cooperative shutdown shared between the pipeline, its workers and the
//! signal handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use crate::trace::debug;

/// One-way latch that ends a run.
///
/// Anyone holding a reference may request shutdown; workers observe it
/// through [`is_requested`](Self::is_requested) and registered pollers are
/// woken so they notice without waiting out their current poll.
#[derive(Debug, Default)]
pub struct ShutdownToken {
    requested: AtomicBool,
    lock: Mutex<()>,
    signal: Condvar,
    wakers: Mutex<Vec<mio::Waker>>,
}

impl ShutdownToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Latches the token and wakes every waiter and registered poller.
    /// Idempotent.
    pub fn request(&self) {
        {
            let _guard = self.lock.lock().expect("shutdown lock poisoned");
            if self.requested.swap(true, Ordering::SeqCst) {
                return;
            }
            self.signal.notify_all();
        }
        debug!("shutdown requested");
        let wakers = self.wakers.lock().expect("shutdown wakers poisoned");
        for waker in wakers.iter() {
            if let Err(_e) = waker.wake() {
                debug!(error = ?_e, "stale shutdown waker");
            }
        }
    }

    #[inline]
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Blocks the caller until shutdown is requested.
    pub fn wait(&self) {
        let mut guard = self.lock.lock().expect("shutdown lock poisoned");
        while !self.requested.load(Ordering::SeqCst) {
            guard = self.signal.wait(guard).expect("shutdown lock poisoned");
        }
    }

    /// Registers a poll waker to be fired on [`request`](Self::request).
    ///
    /// If shutdown was already requested the waker fires immediately, so a
    /// late registrant cannot sleep through the latch.
    pub fn register_waker(&self, waker: mio::Waker) {
        let mut wakers = self.wakers.lock().expect("shutdown wakers poisoned");
        if self.requested.load(Ordering::SeqCst) {
            if let Err(_e) = waker.wake() {
                debug!(error = ?_e, "stale shutdown waker");
            }
        }
        wakers.push(waker);
    }
}
