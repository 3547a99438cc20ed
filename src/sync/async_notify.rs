//! Async notifier: a reactor handle plus a target coroutine and a
//! done-flag used to coalesce wake-ups, callable from any OS thread.
//! Reuses `event::work`'s `mio::Waker`-based cross-thread wake-up plumbing
//! rather than inventing a second one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use mio::Waker;

use crate::coroutine::{self, Id};
use crate::error::Result;
use crate::event::{self, Timeout};

struct Shared {
    waker: Arc<Waker>,
    completions: Arc<Mutex<Vec<Id>>>,
    done: AtomicBool,
    waiting: Mutex<Option<Id>>,
    cleanup: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// Created on the runtime that will wait; clone `Notifier::sender()` to
/// hand the notifying half to another thread.
pub struct AsyncNotify {
    shared: Arc<Shared>,
}

#[derive(Clone)]
pub struct NotifySender {
    shared: Arc<Shared>,
}

impl AsyncNotify {
    pub fn create() -> Result<AsyncNotify> {
        let (waker, completions) = event::with_reactor(|r| r.waker_for_work(event::WAKER_TOKEN));
        Ok(AsyncNotify {
            shared: Arc::new(Shared {
                waker,
                completions,
                done: AtomicBool::new(false),
                waiting: Mutex::new(None),
                cleanup: Mutex::new(None),
            }),
        })
    }

    pub fn sender(&self) -> NotifySender {
        NotifySender { shared: self.shared.clone() }
    }

    /// Registers a cleanup callback that fires once, the first time
    /// `wait()` observes the notifier closed.
    pub fn on_close(&self, cb: impl FnOnce() + Send + 'static) {
        *self.shared.cleanup.lock().unwrap() = Some(Box::new(cb));
    }

    /// Blocks the calling coroutine until notified (from any thread) or
    /// `timeout` elapses.
    pub fn wait(&self, timeout_ms: i64) -> Result<()> {
        if self.shared.done.swap(false, Ordering::AcqRel) {
            self.run_cleanup_if_pending();
            return Ok(());
        }
        *self.shared.waiting.lock().unwrap() = Some(coroutine::current());
        let result = event::suspend_with_timeout(Timeout::from_millis(timeout_ms));
        self.shared.waiting.lock().unwrap().take();
        self.run_cleanup_if_pending();
        result.map(|_| ())
    }

    fn run_cleanup_if_pending(&self) {
        if let Some(cb) = self.shared.cleanup.lock().unwrap().take() {
            cb();
        }
    }
}

impl NotifySender {
    /// Wakes the waiting coroutine, callable from any OS thread. Coalesces:
    /// a notify with nobody waiting yet just sets the done-flag, which the
    /// next `wait()` observes and returns from immediately.
    pub fn notify(&self) {
        self.shared.done.store(true, Ordering::Release);
        if let Some(id) = self.shared.waiting.lock().unwrap().take() {
            self.shared.completions.lock().unwrap().push(id);
            let _ = self.shared.waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_returns_immediately_once_notified() {
        let notifier = AsyncNotify::create().unwrap();
        notifier.sender().notify();
        assert!(notifier.wait(0).is_ok());
    }
}
