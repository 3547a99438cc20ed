//! The single-threaded-per-runtime coroutine scheduler: `spawn()` creates
//! and immediately resumes a coroutine on the calling runtime, and
//! `JoinHandle` waits on a [`crate::sync::MonoBarrier`]-backed rendezvous
//! rather than a cross-thread one.

use std::cell::RefCell;
use std::rc::Rc;

use crate::coroutine::{self, Id};
use crate::error::{Code, Error, Result};
use crate::options::Options;
use crate::sync::mono_barrier::MonoBarrier;

struct Shared<T> {
    barrier: MonoBarrier,
    result: RefCell<Option<T>>,
}

/// A handle to a spawned coroutine's eventual result, the way
/// `std::thread::JoinHandle` is to a spawned thread.
pub struct JoinHandle<T> {
    id: Id,
    shared: Rc<Shared<T>>,
}

impl<T> JoinHandle<T> {
    pub fn coroutine_id(&self) -> Id {
        self.id
    }

    /// Blocks the calling coroutine until the spawned one has finished.
    ///
    /// If the spawned coroutine's entry closure panicked, that panic is
    /// re-raised here rather than left to hang the barrier forever, the
    /// same poisoning `std::thread::JoinHandle::join` gives a caller whose
    /// spawned thread panicked.
    pub fn join(self) -> Result<T> {
        self.shared.barrier.wait()?;
        if let Some(result) = self.shared.result.borrow_mut().take() {
            return Ok(result);
        }
        if let Some(panic) = coroutine::take_panic(self.id) {
            std::panic::resume_unwind(panic);
        }
        Err(Error::new(Code::Eio, "join handle's barrier fired with no result stored"))
    }

    /// True once the spawned coroutine has produced its result.
    pub fn is_finished(&self) -> bool {
        self.shared.result.borrow().is_some()
    }
}

/// Notifies a [`MonoBarrier`] exactly once, whether the guarded closure
/// returns normally (disarmed beforehand) or unwinds through it.
struct NotifyOnUnwind<T> {
    shared: Rc<Shared<T>>,
    armed: bool,
}

impl<T> Drop for NotifyOnUnwind<T> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.barrier.notify();
        }
    }
}

/// Spawn a new coroutine with default options.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    spawn_opts(f, Options::default())
}

/// Spawn a new coroutine with explicit options (stack size, name).
pub fn spawn_opts<F, T>(f: F, opts: Options) -> JoinHandle<T>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    let shared = Rc::new(Shared { barrier: MonoBarrier::new(), result: RefCell::new(None) });
    let shared_in_coroutine = shared.clone();

    let id = coroutine::create(opts.stack_size, move || {
        let mut guard = NotifyOnUnwind { shared: shared_in_coroutine.clone(), armed: true };
        let result = f();
        *shared_in_coroutine.result.borrow_mut() = Some(result);
        guard.armed = false;
        shared_in_coroutine.barrier.notify();
    })
    .expect("coroutine::create failed for scheduler::spawn");

    let _ = coroutine::resume(id, 0);

    JoinHandle { id, shared }
}

/// Give up the CPU: yield to whoever else is ready, resuming on the next
/// scheduling pass.
pub fn sched() -> Result<()> {
    coroutine::yield_now(0).map(|_| ())
}

/// Drive the reactor until every coroutine but the caller has finished,
/// the cooperative equivalent of `std::thread::JoinHandle::join` for an
/// entire batch of spawned work with no handle kept around.
pub fn wait_all() {
    while coroutine::active_count() > 1 {
        if crate::event::wait(None).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_and_join_returns_result() {
        let handle = spawn(|| 2 + 2);
        assert_eq!(handle.join().unwrap(), 4);
    }

    #[test]
    fn join_resumes_the_panic_instead_of_hanging() {
        let handle: JoinHandle<i32> = spawn(|| panic!("boom"));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handle.join()));
        assert!(result.is_err());
    }

    #[test]
    fn spawn_many_and_wait_all() {
        let mut handles = Vec::new();
        for i in 0..10 {
            handles.push(spawn(move || i * 2));
        }
        wait_all();
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.join().unwrap(), i * 2);
        }
    }
}
