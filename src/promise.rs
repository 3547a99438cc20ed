//! Promise-style chaining over [`crate::scheduler::JoinHandle`].
//!
//! Single-runtime, not cross-thread: every `then`/`chain`/`success` spawns
//! a new coroutine on the calling thread's runtime rather than handing work
//! to another OS thread, matching the rest of this crate's "no send bounds,
//! everything stays on one runtime" discipline.

use crate::options::Options;
use crate::scheduler::{self, JoinHandle};

/// Stores the eventual result of a spawned coroutine as `Ok(T)` or `Err(E)`.
pub struct Promise<T, E> {
    join_handle: JoinHandle<Result<T, E>>,
}

impl<T, E> Promise<T, E>
where
    T: 'static,
    E: 'static,
{
    pub fn spawn<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<T, E> + 'static,
    {
        Promise { join_handle: scheduler::spawn(f) }
    }

    pub fn spawn_opts<F>(f: F, opts: Options) -> Self
    where
        F: FnOnce() -> Result<T, E> + 'static,
    {
        Promise { join_handle: scheduler::spawn_opts(f, opts) }
    }

    /// Blocks the calling coroutine until the result is ready.
    pub fn sync(self) -> Result<T, E> {
        self.join_handle.join().expect("promise's coroutine was canceled before producing a result")
    }

    pub fn then<TT, EE, FT, FE>(self, ft: FT, fe: FE) -> Promise<TT, EE>
    where
        TT: 'static,
        EE: 'static,
        FT: FnOnce(T) -> Result<TT, EE> + 'static,
        FE: FnOnce(E) -> Result<TT, EE> + 'static,
    {
        let join_handle = scheduler::spawn(move || match self.sync() {
            Ok(t) => ft(t),
            Err(e) => fe(e),
        });
        Promise { join_handle }
    }

    pub fn chain<TT, EE, F>(self, f: F) -> Promise<TT, EE>
    where
        TT: 'static,
        EE: 'static,
        F: FnOnce(Result<T, E>) -> Result<TT, EE> + 'static,
    {
        let join_handle = scheduler::spawn(move || f(self.sync()));
        Promise { join_handle }
    }

    pub fn success<TT, F>(self, f: F) -> Promise<TT, E>
    where
        TT: 'static,
        F: FnOnce(T) -> Result<TT, E> + 'static,
    {
        let join_handle = scheduler::spawn(move || match self.sync() {
            Ok(t) => f(t),
            Err(e) => Err(e),
        });
        Promise { join_handle }
    }

    pub fn fail<F>(self, f: F) -> Promise<T, E>
    where
        F: FnOnce(E) -> Result<T, E> + 'static,
    {
        let join_handle = scheduler::spawn(move || match self.sync() {
            Ok(t) => Ok(t),
            Err(e) => f(e),
        });
        Promise { join_handle }
    }

    pub fn finally<F>(self, f: F)
    where
        F: FnOnce(Result<T, E>) + 'static,
    {
        scheduler::spawn(move || f(self.sync()));
    }

    pub fn finally_sync<F>(self, f: F)
    where
        F: FnOnce(Result<T, E>),
    {
        f(self.sync())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chains_success_through_then() {
        let result = Promise::<i32, String>::spawn(|| Ok(2))
            .then(|t| Ok::<i32, String>(t * 10), |e| Err(e))
            .sync();
        assert_eq!(result, Ok(20));
    }

    #[test]
    fn fail_only_runs_on_err() {
        let result: Result<i32, String> = Promise::spawn(|| Err("boom".to_string())).fail(|e| Err(format!("{}!", e))).sync();
        assert_eq!(result, Err("boom!".to_string()));
    }

    #[test]
    fn sync_resumes_a_panic_from_the_spawned_coroutine() {
        let promise: Promise<i32, String> = Promise::spawn(|| panic!("boom"));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| promise.sync()));
        assert!(result.is_err());
    }
}
