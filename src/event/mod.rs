//! The event-loop bridge: turns reactor completion callbacks into
//! synchronous return values for the calling coroutine.
//!
//! `mio` is the reactor, providing one-shot I/O handles and a tick
//! function. Every adapter in this module and its submodules follows the
//! same shape: register interest with the reactor, `yield_now()`, get
//! resumed either by the reactor's callback or by a timeout/cancel.

pub mod dns;
pub mod fork_hook;
pub mod fs;
pub mod poll;
pub mod process;
pub mod signal;
pub mod timer;
pub mod work;

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::sync::{Arc, Mutex};

use crate::coroutine::{self, Id};
use crate::error::{Code, Error, Result};

/// One outstanding I/O registration. `waiter` is cleared (set to `None`) the
/// moment the coroutine stops owning it — either because it was resumed, or
/// because it timed out/was canceled and the bridge must free the record
/// alone when the callback eventually (or never) fires. `ready` records
/// what `mio` actually observed on the last tick that touched this
/// registration, so a caller like [`crate::event::poll::poll_one`] can read
/// back the real ready set instead of assuming its request was satisfied
/// verbatim.
struct IoWaiter {
    waiter: Option<Id>,
    ready: IoReadiness,
}

/// The readiness bits `mio::event::Event` exposes, kept independent of any
/// particular caller's own event-bit encoding (e.g. `poll::PollEvents`).
#[derive(Debug, Clone, Copy, Default)]
pub struct IoReadiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub closed: bool,
}

impl From<&mio::event::Event> for IoReadiness {
    fn from(ev: &mio::event::Event) -> Self {
        IoReadiness {
            readable: ev.is_readable(),
            writable: ev.is_writable(),
            error: ev.is_error(),
            closed: ev.is_read_closed() || ev.is_write_closed(),
        }
    }
}

struct TimerEntry {
    deadline: Instant,
    id: Id,
    generation: u64,
    /// A non-zero generation lets a cancelled timer remain in the heap
    /// (removal from a `BinaryHeap` is O(n)) without triggering a spurious
    /// resume — the entry is simply skipped once popped and compared.
    sequence: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline).then(self.sequence.cmp(&other.sequence))
    }
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    io_waiters: Slab<IoWaiter>,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    timer_generations: std::collections::HashMap<u64, u64>,
    next_timer_id: u64,
    next_sequence: u64,
    defer_queue_a: Vec<Box<dyn FnOnce()>>,
    defer_queue_b: Vec<Box<dyn FnOnce()>>,
    shutdown_tasks: Vec<Box<dyn FnOnce()>>,
    waker: Option<Arc<Waker>>,
    /// Shared with any in-flight `event::work` jobs so a background OS
    /// thread can hand a finished coroutine id back to this runtime's
    /// thread without going through its own (unrelated) thread-local
    /// `Reactor`.
    completions: Arc<Mutex<Vec<Id>>>,
    signal_receiver: Option<mio::unix::pipe::Receiver>,
}

/// Reserved tokens outside the range the `io_waiters` slab ever allocates
/// (its keys start at 0 and grow), so they can never collide.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);
pub(crate) const SIGNAL_TOKEN: Token = Token(usize::MAX - 1);

thread_local! {
    static REACTOR: RefCell<Reactor> = RefCell::new(Reactor::new());
}

impl Reactor {
    fn new() -> Self {
        Reactor {
            poll: Poll::new().expect("failed to create mio::Poll for this runtime"),
            events: Events::with_capacity(1024),
            io_waiters: Slab::new(),
            timers: BinaryHeap::new(),
            timer_generations: std::collections::HashMap::new(),
            next_timer_id: 1,
            next_sequence: 1,
            defer_queue_a: Vec::new(),
            defer_queue_b: Vec::new(),
            shutdown_tasks: Vec::new(),
            waker: None,
            completions: Arc::new(Mutex::new(Vec::new())),
            signal_receiver: None,
        }
    }

    /// Lazily creates and registers this runtime's cross-thread waker,
    /// used by `event::work` to signal a completed background job. Returns
    /// both the waker and a handle to the completion queue it should push
    /// onto, since the job runs on a thread with no access to this
    /// thread-local `Reactor`.
    pub(crate) fn waker_for_work(&mut self, token: Token) -> (Arc<Waker>, Arc<Mutex<Vec<Id>>>) {
        if self.waker.is_none() {
            let waker = Waker::new(self.poll.registry(), token)
                .expect("failed to create mio::Waker for this runtime");
            self.waker = Some(Arc::new(waker));
        }
        (self.waker.as_ref().unwrap().clone(), self.completions.clone())
    }

    /// Registers the signal-relay self-pipe's read end, idempotent.
    pub(crate) fn ensure_signal_pipe(&mut self) -> Result<()> {
        if self.signal_receiver.is_some() {
            return Ok(());
        }
        let (sender, mut receiver) = mio::unix::pipe::new()
            .map_err(|e| Error::new(Code::Eio, format!("self-pipe creation failed: {}", e)))?;
        self.poll
            .registry()
            .register(&mut receiver, SIGNAL_TOKEN, Interest::READABLE)
            .map_err(|e| Error::new(Code::Eio, format!("self-pipe registration failed: {}", e)))?;
        self.signal_receiver = Some(receiver);
        crate::event::signal::install_sender(sender);
        Ok(())
    }

    pub(crate) fn signal_receiver_mut(&mut self) -> Option<&mut mio::unix::pipe::Receiver> {
        self.signal_receiver.as_mut()
    }
}

pub(crate) fn with_reactor<R>(f: impl FnOnce(&mut Reactor) -> R) -> R {
    REACTOR.with(|r| f(&mut r.borrow_mut()))
}

/// Rebuilds this thread's reactor from scratch: the parent's `Poll` fd
/// and every registration inherited across `fork()` are meaningless in
/// the child.
pub fn reset_reactor() {
    REACTOR.with(|r| *r.borrow_mut() = Reactor::new());
}

/// Register a token for `source` and record the current coroutine as its
/// waiter. Returns the token to pass to `deregister`/`cancel_io`.
pub fn register_io(source: &mut impl mio::event::Source, interest: Interest) -> Result<Token> {
    with_reactor(|r| {
        let key = r.io_waiters.insert(IoWaiter { waiter: Some(coroutine::current()), ready: IoReadiness::default() });
        let token = Token(key);
        r.poll.registry().register(source, token, interest).map_err(|e| {
            r.io_waiters.remove(key);
            Error::new(Code::Eio, format!("mio registration failed: {}", e))
        })?;
        Ok(token)
    })
}

pub fn reregister_io(source: &mut impl mio::event::Source, token: Token, interest: Interest) -> Result<()> {
    with_reactor(|r| {
        r.poll
            .registry()
            .reregister(source, token, interest)
            .map_err(|e| Error::new(Code::Eio, format!("mio reregistration failed: {}", e)))
    })
}

pub fn deregister_io(source: &mut impl mio::event::Source, token: Token) {
    with_reactor(|r| {
        let _ = r.poll.registry().deregister(source);
        r.io_waiters.remove(token.0);
    });
}

/// The readiness `mio` last observed for `token`, if any. Call this before
/// `deregister_io`, which drops the record.
pub fn io_readiness(token: Token) -> IoReadiness {
    with_reactor(|r| r.io_waiters.get(token.0).map(|w| w.ready).unwrap_or_default())
}

/// Cancel without deregistering from mio yet (the socket is being closed by
/// a third party while we're still suspended in it) — wakes the waiter with
/// `ECANCELED` and marks the slot so a late mio event is a no-op.
pub fn cancel_io(token: Token) {
    let waiter = with_reactor(|r| {
        r.io_waiters.get_mut(token.0).and_then(|w| w.waiter.take())
    });
    if let Some(id) = waiter {
        let _ = coroutine::resume(id, Code::Ecanceled as usize);
    }
}

/// Arm a one-shot timer that resumes `id` with `ETIMEDOUT` data after `dur`.
/// Returns a handle for `cancel_timer`.
pub fn arm_timer(dur: Duration, id: Id) -> u64 {
    with_reactor(|r| {
        let timer_id = r.next_timer_id;
        r.next_timer_id += 1;
        let sequence = r.next_sequence;
        r.next_sequence += 1;
        r.timer_generations.insert(timer_id, sequence);
        r.timers.push(Reverse(TimerEntry {
            deadline: Instant::now() + dur,
            id,
            generation: timer_id,
            sequence,
        }));
        timer_id
    })
}

pub fn cancel_timer(timer_id: u64) {
    with_reactor(|r| {
        r.timer_generations.remove(&timer_id);
    });
}

/// Schedule a callback to run on a later tick, used for re-entrancy-safe
/// cleanup when a reactor forbids freeing a handle from inside its own
/// callback. Two-tick defer: callbacks queued during tick N run at the
/// start of tick N+2.
pub fn defer(cb: impl FnOnce() + 'static) {
    with_reactor(|r| r.defer_queue_a.push(Box::new(cb)));
}

/// Register a callback invoked once before the event loop stops.
pub fn register_runtime_shutdown_task(cb: impl FnOnce() + 'static) {
    with_reactor(|r| r.shutdown_tasks.push(Box::new(cb)));
}

pub fn run_shutdown_tasks() {
    let tasks = with_reactor(|r| std::mem::take(&mut r.shutdown_tasks));
    for task in tasks {
        task();
    }
}

/// Run one pass of the reactor: block for at most `timeout` (`None` =
/// forever), resume every coroutine whose operation
/// completed. Returns `Ok(())` if at least one operation completed or a
/// timer fired, `Err(ETIMEDOUT)` if the poll itself ran out of time with
/// nothing ready.
pub fn wait(timeout: Option<Duration>) -> Result<()> {
    // Rotate the defer queues: run what was queued two ticks ago.
    let to_run = with_reactor(|r| {
        let ready = std::mem::take(&mut r.defer_queue_b);
        r.defer_queue_b = std::mem::take(&mut r.defer_queue_a);
        ready
    });
    for cb in to_run {
        cb();
    }

    let next_deadline = with_reactor(|r| r.timers.peek().map(|Reverse(t)| t.deadline));
    let poll_timeout = match (timeout, next_deadline) {
        (Some(t), Some(d)) => Some(t.min(d.saturating_duration_since(Instant::now()))),
        (Some(t), None) => Some(t),
        (None, Some(d)) => Some(d.saturating_duration_since(Instant::now())),
        (None, None) => None,
    };

    let poll_result = with_reactor(|r| {
        let Reactor { poll, events, .. } = &mut *r;
        poll.poll(events, poll_timeout)
    });
    if let Err(e) = poll_result {
        if e.kind() != std::io::ErrorKind::Interrupted {
            return Err(Error::new(Code::Eio, format!("reactor poll failed: {}", e)));
        }
    }

    let mut woke_any = false;
    let signal_ready = with_reactor(|r| r.events.iter().any(|ev| ev.token() == SIGNAL_TOKEN));
    if signal_ready {
        signal::drain_and_dispatch();
        woke_any = true;
    }

    let ready_waiters: Vec<Id> = with_reactor(|r| {
        r.events
            .iter()
            .filter_map(|ev| {
                let token = ev.token();
                if token == WAKER_TOKEN || token == SIGNAL_TOKEN {
                    return None;
                }
                let readiness = IoReadiness::from(ev);
                let entry = r.io_waiters.get_mut(token.0)?;
                entry.ready = readiness;
                entry.waiter.take()
            })
            .collect()
    });
    for id in ready_waiters {
        woke_any = true;
        let _ = coroutine::resume(id, 0);
    }

    let completed: Vec<Id> = with_reactor(|r| std::mem::take(&mut *r.completions.lock().unwrap()));
    for id in completed {
        woke_any = true;
        let _ = coroutine::resume(id, 0);
    }

    let now = Instant::now();
    loop {
        let fired = with_reactor(|r| {
            match r.timers.peek() {
                Some(Reverse(t)) if t.deadline <= now => {
                    let Reverse(entry) = r.timers.pop().unwrap();
                    let still_armed = r.timer_generations.remove(&entry.generation) == Some(entry.sequence);
                    Some((entry.id, still_armed))
                }
                _ => None,
            }
        });
        match fired {
            Some((id, true)) => {
                woke_any = true;
                let _ = coroutine::resume(id, Code::Etimedout as usize);
            }
            Some((_, false)) => continue,
            None => break,
        }
    }

    if woke_any {
        Ok(())
    } else {
        Err(Error::new(Code::Etimedout, "reactor pass completed with nothing ready"))
    }
}

/// Timeout policy: negative = forever, zero = try-now only, positive =
/// race a timer against completion.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    Forever,
    None,
    After(Duration),
}

impl Timeout {
    pub fn from_millis(ms: i64) -> Timeout {
        if ms < 0 {
            Timeout::Forever
        } else if ms == 0 {
            Timeout::None
        } else {
            Timeout::After(Duration::from_millis(ms as u64))
        }
    }
}

/// Suspend the current coroutine, subject to `timeout`. On completion via
/// the reactor (or external resume), returns the datum passed to
/// `coroutine::resume`. On an armed timer firing first, returns `ETIMEDOUT`.
/// Zero timeout never yields past one reactor tick ("try now").
pub fn suspend_with_timeout(timeout: Timeout) -> Result<usize> {
    match timeout {
        Timeout::None => {
            let _ = wait(Some(Duration::ZERO));
            Err(Error::new(Code::Etimedout, "zero-timeout operation did not complete immediately"))
        }
        Timeout::Forever => {
            let data = coroutine::yield_now(0).map_err(|e| e)?;
            decode_yield(data)
        }
        Timeout::After(dur) => {
            let id = coroutine::current();
            let timer_id = arm_timer(dur, id);
            let data = coroutine::yield_now(0)?;
            cancel_timer(timer_id);
            decode_yield(data)
        }
    }
}

fn decode_yield(data: usize) -> Result<usize> {
    if data == Code::Etimedout as usize {
        Err(Error::new(Code::Etimedout, "operation timed out"))
    } else if data == Code::Ecanceled as usize {
        Err(Error::new(Code::Ecanceled, "operation was canceled"))
    } else {
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_does_not_block() {
        let start = Instant::now();
        let result = suspend_with_timeout(Timeout::None);
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
