//! Timer sleep/delay adapter.

use std::time::Duration;

use crate::error::Result;
use crate::event::{self, Timeout};

/// Suspend the current coroutine for `dur`, then resume. Unlike a generic
/// I/O wait, a bare sleep always "times out" by design — that's success,
/// not failure, so we swallow the `ETIMEDOUT` the underlying primitive
/// reports and return `Ok(())`.
pub fn sleep(dur: Duration) -> Result<()> {
    match event::suspend_with_timeout(Timeout::After(dur)) {
        Ok(_) => Ok(()),
        Err(e) if e.code == crate::error::Code::Etimedout => Ok(()),
        Err(e) => Err(e),
    }
}

pub fn sleep_ms(ms: u64) -> Result<()> {
    sleep(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coroutine;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Instant;

    #[test]
    fn sleep_resumes_after_duration() {
        let done = Rc::new(RefCell::new(false));
        let done2 = done.clone();
        let id = coroutine::create(0, move || {
            sleep_ms(10).unwrap();
            *done2.borrow_mut() = true;
        })
        .unwrap();

        coroutine::resume(id, 0).unwrap();
        assert!(!*done.borrow());

        let start = Instant::now();
        while !*done.borrow() && start.elapsed() < Duration::from_secs(2) {
            event::wait(Some(Duration::from_millis(20))).ok();
        }
        assert!(*done.borrow());
    }
}
