//! Per-OS-thread globals: the coroutine arena, the current/scheduler/main
//! ids, and the round counter.
//!
//! Everything here is thread-local: two coroutines on different OS threads
//! never share a `Runtime`, and objects must not migrate across runtimes.
//! Coroutines live in a [`slab::Slab`] arena and refer to each other by
//! [`crate::coroutine::Id`] rather than raw pointers.

use std::cell::RefCell;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use slab::Slab;

use crate::coroutine::{Coroutine, Id};
use crate::log as catlog;

/// `CAT_LOG_TYPE_*`-equivalent severity used for dead-lock reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Info,
    Notice,
    Warning,
    Error,
}

pub struct Runtime {
    pub coroutines: Slab<Coroutine>,
    pub main: Id,
    pub current: Id,
    pub last_id: u64,
    pub count: usize,
    pub peak_count: usize,
    pub round: u64,
    pub default_stack_size: usize,
    pub dead_lock_log_type: LogLevel,
    /// Mirrors `round` in a form [`crate::watchdog`] can poll from a
    /// different OS thread without touching this thread-local `Runtime`.
    pub round_counter: Arc<AtomicU64>,
}

pub const MAIN_ID: Id = Id(0);
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;
pub const MIN_STACK_SIZE: usize = 64 * 1024;
pub const MAX_STACK_SIZE: usize = 32 * 1024 * 1024;

impl Runtime {
    fn new() -> Self {
        let mut coroutines = Slab::with_capacity(64);
        let main_key = coroutines.insert(Coroutine::new_main());
        debug_assert_eq!(main_key, 0);

        Runtime {
            coroutines,
            main: MAIN_ID,
            current: MAIN_ID,
            last_id: 1,
            count: 1,
            peak_count: 1,
            round: 0,
            default_stack_size: DEFAULT_STACK_SIZE,
            dead_lock_log_type: LogLevel::Warning,
            round_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn round_counter(&self) -> Arc<AtomicU64> {
        self.round_counter.clone()
    }

    pub fn align_stack_size(&self, size: usize) -> usize {
        if size == 0 {
            self.default_stack_size
        } else {
            size.clamp(MIN_STACK_SIZE, MAX_STACK_SIZE)
        }
    }
}

thread_local! {
    pub static RUNTIME: RefCell<Runtime> = RefCell::new(Runtime::new());
}

/// Runs `f` with mutable access to this thread's runtime. Panics if called
/// reentrantly (e.g. from inside another `with_runtime` closure) — the same
/// restriction as the C library's single-threaded global struct.
pub fn with_runtime<R>(f: impl FnOnce(&mut Runtime) -> R) -> R {
    RUNTIME.with(|rt| f(&mut rt.borrow_mut()))
}

pub fn current_id() -> Id {
    with_runtime(|rt| rt.current)
}

/// A thread-safe handle to this runtime's round counter, for
/// [`crate::watchdog`] to poll without crossing the thread-local boundary.
pub fn round_counter() -> Arc<AtomicU64> {
    with_runtime(|rt| rt.round_counter())
}

pub fn round() -> u64 {
    with_runtime(|rt| rt.round)
}

pub fn set_default_stack_size(size: usize) -> usize {
    with_runtime(|rt| {
        let original = rt.default_stack_size;
        rt.default_stack_size = rt.align_stack_size(size);
        original
    })
}

pub fn set_dead_lock_log_type(level: LogLevel) {
    with_runtime(|rt| rt.dead_lock_log_type = level);
}

/// Rebuilds this thread's runtime from scratch, dropping every coroutine
/// inherited from a parent process across `fork()`.
pub fn reset() {
    RUNTIME.with(|rt| *rt.borrow_mut() = Runtime::new());
}

/// A coroutine yielded with nowhere to go: the main coroutine has no
/// `previous`. Logs at the configured level and aborts, matching
/// `cat_core_error`/`cat_core_error_with_last`'s `error`/`core-error`
/// severity split.
pub fn report_dead_lock() -> ! {
    let level = with_runtime(|rt| rt.dead_lock_log_type);
    let message = "Dead lock: the last coroutine yielded without a resumer";
    match level {
        LogLevel::Info => log::info!("{}", message),
        LogLevel::Notice => log::info!("{}", message),
        LogLevel::Warning => log::warn!("{}", message),
        LogLevel::Error => log::error!("{}", message),
    }
    catlog::init();
    panic!("{}", message);
}
