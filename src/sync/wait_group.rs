//! Wait group: a counter plus a list of coroutines blocked in `wait()`
//! until it reaches zero.

use std::cell::RefCell;
use std::rc::Rc;

use crate::coroutine::{self, Id};
use crate::error::{Code, Error, Result};
use crate::event::{self, Timeout};

struct Inner {
    counter: i64,
    waiters: Vec<Id>,
}

#[derive(Clone)]
pub struct WaitGroup {
    inner: Rc<RefCell<Inner>>,
}

impl WaitGroup {
    pub fn new() -> WaitGroup {
        WaitGroup { inner: Rc::new(RefCell::new(Inner { counter: 0, waiters: Vec::new() })) }
    }

    /// Adds `delta` to the counter. A negative delta is a caller error
    /// (use `done()`), and adding while someone waits is a misuse.
    pub fn add(&self, delta: i64) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if delta < 0 {
            return Err(Error::new(Code::Einval, "WaitGroup::add with a negative delta"));
        }
        if !inner.waiters.is_empty() {
            return Err(Error::new(Code::Emisuse, "WaitGroup::add called while a waiter is parked"));
        }
        inner.counter += delta;
        Ok(())
    }

    pub fn done(&self) {
        let waiters = {
            let mut inner = self.inner.borrow_mut();
            inner.counter -= 1;
            if inner.counter > 0 {
                return;
            }
            inner.counter = inner.counter.max(0);
            std::mem::take(&mut inner.waiters)
        };
        for id in waiters {
            let _ = coroutine::resume(id, 0);
        }
    }

    /// Blocks until the counter reaches zero. Only one concurrent waiter
    /// is supported; a second concurrent `wait()` is a misuse error.
    pub fn wait(&self, timeout_ms: i64) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.counter == 0 {
                return Ok(());
            }
            if !inner.waiters.is_empty() {
                return Err(Error::new(Code::Emisuse, "WaitGroup already has a waiter"));
            }
            inner.waiters.push(coroutine::current());
        }
        let result = event::suspend_with_timeout(Timeout::from_millis(timeout_ms));
        if result.is_err() {
            let me = coroutine::current();
            self.inner.borrow_mut().waiters.retain(|id| *id != me);
        }
        result.map(|_| ())
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        WaitGroup::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_returns_immediately_at_zero() {
        let wg = WaitGroup::new();
        assert!(wg.wait(0).is_ok());
    }

    #[test]
    fn add_rejects_negative_delta() {
        let wg = WaitGroup::new();
        assert_eq!(wg.add(-1).unwrap_err().code, Code::Einval);
    }

    #[test]
    fn done_wakes_waiter_at_zero() {
        let wg = WaitGroup::new();
        wg.add(1).unwrap();
        let waiter = wg.clone();
        let id = coroutine::create(0, move || {
            waiter.wait(-1).unwrap();
        })
        .unwrap();
        coroutine::resume(id, 0).unwrap();
        assert_eq!(coroutine::active_count(), 2);
        wg.done();
        assert_eq!(coroutine::active_count(), 1);
    }
}
