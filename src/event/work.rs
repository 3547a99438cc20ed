//! Worker-thread dispatch: run a blocking closure on a background OS
//! thread and await its result from the calling coroutine.
//!
//! The pool itself is a small work-stealing queue built on
//! `crossbeam-deque`, repurposed here from scheduling coroutines across
//! worker threads to scheduling blocking closures on their behalf.
//! Cross-thread wakeup into the single-threaded reactor uses `mio::Waker`,
//! the mechanism `mio` provides precisely for "wake a `Poll::poll()` call
//! from another thread".

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use crossbeam_deque::{Injector, Steal};
use mio::{Token, Waker};

use crate::coroutine::Id;
use crate::error::{Code, Error, Result};
use crate::event::{self, Timeout};

/// Hints for pool sizing/routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Cpu,
    FastIo,
    SlowIo,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Pool {
    injector: Injector<Job>,
    lock: Mutex<()>,
    condvar: Condvar,
    shutdown: AtomicBool,
}

static POOL: OnceLock<Arc<Pool>> = OnceLock::new();

fn pool() -> Arc<Pool> {
    POOL.get_or_init(|| {
        let pool = Arc::new(Pool {
            injector: Injector::new(),
            lock: Mutex::new(()),
            condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let worker_count = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4).max(2);
        for i in 0..worker_count {
            let pool = pool.clone();
            std::thread::Builder::new()
                .name(format!("cat-work-{}", i))
                .spawn(move || worker_loop(pool))
                .expect("failed to spawn cat worker thread");
        }
        pool
    })
    .clone()
}

fn worker_loop(pool: Arc<Pool>) {
    loop {
        loop {
            match pool.injector.steal() {
                Steal::Success(job) => {
                    job();
                    break;
                }
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
        if pool.shutdown.load(Ordering::Relaxed) {
            return;
        }
        let guard = pool.lock.lock().unwrap();
        let _ = pool.condvar.wait_timeout(guard, Duration::from_millis(50)).unwrap();
    }
}

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Installs this runtime's cross-thread waker into the reactor, idempotent,
/// and returns it alongside the completion queue a background thread must
/// push onto (its own thread-local `Reactor`, if any, is unrelated to ours).
fn waker_and_completions() -> (Arc<Waker>, Arc<Mutex<Vec<Id>>>) {
    event::with_reactor(|r| r.waker_for_work(WAKER_TOKEN))
}

type ResultSlot = Arc<Mutex<Option<Box<dyn Any + Send>>>>;

/// Submit `f` to the thread pool and block the calling coroutine until it
/// completes or `timeout` elapses. On timeout/cancel, the worker keeps
/// running to completion but its result is discarded.
pub fn dispatch<T, F>(kind: WorkKind, timeout: Option<Duration>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (waker, completions) = waker_and_completions();
    let slot: ResultSlot = Arc::new(Mutex::new(None));
    let slot2 = slot.clone();
    let id = crate::coroutine::current();

    log::trace!("dispatching {:?} work for {}", kind, id);
    let job: Job = Box::new(move || {
        let result = f();
        *slot2.lock().unwrap() = Some(Box::new(result) as Box<dyn Any + Send>);
        completions.lock().unwrap().push(id);
        let _ = waker.wake();
    });
    pool().injector.push(job);
    {
        let p = pool();
        let _guard = p.lock.lock().unwrap();
        p.condvar.notify_one();
    }

    let timeout = match timeout {
        Some(d) => Timeout::After(d),
        None => Timeout::Forever,
    };
    event::suspend_with_timeout(timeout)?;

    let mut guard = slot.lock().unwrap();
    match guard.take() {
        Some(boxed) => Ok(*boxed.downcast::<T>().expect("work result type mismatch")),
        None => Err(Error::new(Code::Ecanceled, "work result was discarded")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_runs_off_thread_and_returns_result() {
        let id = crate::coroutine::create(0, || {
            let result = dispatch(WorkKind::Cpu, None, || 2 + 2).unwrap();
            assert_eq!(result, 4);
        })
        .unwrap();
        crate::coroutine::resume(id, 0).unwrap();

        let start = std::time::Instant::now();
        while crate::coroutine::active_count() > 1 && start.elapsed() < Duration::from_secs(2) {
            let _ = event::wait(Some(Duration::from_millis(20)));
        }
        assert_eq!(crate::coroutine::active_count(), 1);
    }
}
