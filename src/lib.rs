// Copyright 2015 The coio Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Stackful coroutines with an asynchronous I/O reactor underneath.
//!
//! One [`Runtime`](runtime) per OS thread, addressed entirely through
//! thread-locals; coroutines never migrate between runtimes. `spawn`
//! creates and schedules a coroutine on the calling thread; the reactor
//! (`event::wait`) drives every suspended I/O, timer, signal, and
//! child-process operation back to completion.

pub mod buffer;
pub mod error;
pub mod event;
pub mod http;
pub mod log;
pub mod net;
pub mod options;
pub mod promise;
pub mod scheduler;
pub mod sync;
pub mod watchdog;

mod coroutine;
mod runtime;

use std::time::Duration;

pub use error::{Code, Error, Result};
pub use options::{Builder, Options};
pub use promise::Promise;
pub use scheduler::{spawn, spawn_opts, JoinHandle};

/// Give up the CPU: yield to whoever else is ready.
pub fn sched() -> Result<()> {
    scheduler::sched()
}

/// Put the current coroutine to sleep for `ms` milliseconds.
pub fn sleep_ms(ms: u64) -> Result<()> {
    event::timer::sleep_ms(ms)
}

/// Put the current coroutine to sleep for the given duration.
pub fn sleep(dur: Duration) -> Result<()> {
    event::timer::sleep(dur)
}

/// Drive the reactor until every coroutine but the caller has finished.
pub fn wait_all() {
    scheduler::wait_all()
}

/// Run one pass of the reactor.
pub fn event_wait(timeout: Option<Duration>) -> Result<()> {
    event::wait(timeout)
}

/// Must be called in the child immediately after `fork()`: discards the
/// parent's reactor and runtime state.
///
/// # Safety
/// Must only be called in the freshly-forked child, before any other
/// coroutine or reactor API.
pub unsafe fn event_fork() {
    event::fork_hook::event_fork()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_ms_resumes_the_caller() {
        let id = coroutine::create(0, || {
            sleep_ms(5).unwrap();
        })
        .unwrap();
        coroutine::resume(id, 0).unwrap();

        let start = std::time::Instant::now();
        while coroutine::active_count() > 1 && start.elapsed() < Duration::from_secs(2) {
            let _ = event_wait(Some(Duration::from_millis(20)));
        }
        assert_eq!(coroutine::active_count(), 1);
    }

    #[test]
    fn spawn_and_wait_all_runs_to_completion() {
        let log = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        for i in 0..5 {
            let log = log.clone();
            spawn(move || {
                log.borrow_mut().push(i);
            });
        }
        wait_all();
        assert_eq!(log.borrow().len(), 5);
    }
}
