//! Single-writer, single-reader one-shot notification, underpinning
//! [`crate::scheduler::JoinHandle`]. Sender and receiver always run on the
//! same runtime, so an `Rc` plus a direct `coroutine::resume` suffices —
//! no OS thread parking.

use std::cell::RefCell;
use std::rc::Rc;

use crate::coroutine::{self, Id};
use crate::error::Result;

struct State {
    notified: bool,
    waiter: Option<Id>,
}

#[derive(Clone)]
pub struct MonoBarrier {
    inner: Rc<RefCell<State>>,
}

impl MonoBarrier {
    pub fn new() -> MonoBarrier {
        MonoBarrier { inner: Rc::new(RefCell::new(State { notified: false, waiter: None })) }
    }

    /// Marks the barrier notified and wakes whoever is parked in `wait()`.
    /// A no-op (beyond the flag) if nobody has called `wait()` yet — the
    /// next `wait()` call will see `notified` already set and return
    /// immediately, matching the one-shot "push result, maybe before
    /// anyone asked for it" pattern `JoinHandleSender::push` relies on.
    pub fn notify(&self) {
        let waiter = {
            let mut state = self.inner.borrow_mut();
            state.notified = true;
            state.waiter.take()
        };
        if let Some(id) = waiter {
            let _ = coroutine::resume(id, 0);
        }
    }

    /// Suspends the calling coroutine until `notify()` has been (or
    /// already was) called.
    pub fn wait(&self) -> Result<()> {
        {
            let mut state = self.inner.borrow_mut();
            if state.notified {
                return Ok(());
            }
            state.waiter = Some(coroutine::current());
        }
        coroutine::yield_now(0)?;
        Ok(())
    }
}

impl Default for MonoBarrier {
    fn default() -> Self {
        MonoBarrier::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_returns_immediately_if_already_notified() {
        let barrier = MonoBarrier::new();
        barrier.notify();
        assert!(barrier.wait().is_ok());
    }

    #[test]
    fn wait_blocks_until_notified() {
        let barrier = MonoBarrier::new();
        let waiter = barrier.clone();
        let id = coroutine::create(0, move || {
            waiter.wait().unwrap();
        })
        .unwrap();
        coroutine::resume(id, 0).unwrap();
        assert_eq!(coroutine::active_count(), 2);

        barrier.notify();
        assert_eq!(coroutine::active_count(), 1);
    }
}
