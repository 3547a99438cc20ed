//! Child-process reaping.
//!
//! `waitpid()` itself never blocks here: we only ever call it with `WNOHANG`
//! from the SIGCHLD handler's dispatch pass. A coroutine that asks to wait
//! for a specific pid, or for "any child", parks on a waiter list/tree
//! until that dispatch pass finds a match, or stores the reaped status in
//! a small cache when nobody was asking yet.

use std::collections::HashMap;
use std::sync::Mutex;

use nix::sys::wait::{WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::coroutine::{self, Id};
use crate::error::{Code, Error, Result};
use crate::event::{self, signal, Timeout};

struct WaitpidTask {
    waiters: Vec<Id>,
    status: Option<i32>,
}

struct State {
    /// Coroutines parked in `wait_any()`.
    any_waiters: Vec<Id>,
    /// Coroutines parked in `wait_pid(pid)`, keyed by pid.
    pid_tasks: HashMap<i32, WaitpidTask>,
    /// Exit statuses reaped before anyone asked for them.
    zombie_cache: HashMap<i32, i32>,
    sigchld_refcount: usize,
}

static STATE: Mutex<Option<State>> = Mutex::new(None);

fn state() -> std::sync::MutexGuard<'static, Option<State>> {
    let mut guard = STATE.lock().unwrap();
    if guard.is_none() {
        *guard = Some(State {
            any_waiters: Vec::new(),
            pid_tasks: HashMap::new(),
            zombie_cache: HashMap::new(),
            sigchld_refcount: 0,
        });
    }
    guard
}

/// Reap every exited/stopped child currently available (`WNOHANG`), and
/// dispatch each one to a waiter if possible, else cache it. Invoked from
/// the SIGCHLD relay every time the signal is delivered.
fn dispatch() {
    loop {
        let reaped = match nix::sys::wait::waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED)) {
            Ok(WaitStatus::StillAlive) | Err(_) => None,
            Ok(status) => Some(status),
        };
        let Some(status) = reaped else { break };
        let pid = status_pid(&status);
        let code = encode_status(&status);

        let mut guard = state();
        let state = guard.as_mut().unwrap();
        if let Some(task) = state.pid_tasks.get_mut(&pid) {
            task.status = Some(code);
            let waiters = std::mem::take(&mut task.waiters);
            drop(guard);
            for id in waiters {
                let _ = coroutine::resume(id, 0);
            }
            continue;
        }
        if let Some(id) = state.any_waiters.pop() {
            state.zombie_cache.insert(pid, code);
            drop(guard);
            let _ = coroutine::resume(id, 0);
            continue;
        }
        state.zombie_cache.insert(pid, code);
    }
}

fn status_pid(status: &WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(pid, _)
        | WaitStatus::Signaled(pid, _, _)
        | WaitStatus::Stopped(pid, _)
        | WaitStatus::Continued(pid) => pid.as_raw(),
        WaitStatus::PtraceEvent(pid, _, _) | WaitStatus::PtraceSyscall(pid) => pid.as_raw(),
        WaitStatus::StillAlive => -1,
    }
}

fn encode_status(status: &WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => *code << 8,
        WaitStatus::Signaled(_, sig, _) => *sig as i32,
        WaitStatus::Stopped(_, sig) => (*sig as i32) << 8 | 0x7f,
        _ => 0,
    }
}

/// Arms the self-pipe (if not already) and hooks `dispatch()` to run
/// synchronously, on the runtime's own thread, every time SIGCHLD is
/// relayed through it — mirroring `cat_os_wait_sigchld_watcher_start`'s
/// refcounted start without ever touching `waitpid()` from signal context.
fn install_sigchld_relay() -> Result<()> {
    event::with_reactor(|r| r.ensure_signal_pipe())?;
    let mut guard = state();
    let state = guard.as_mut().unwrap();
    state.sigchld_refcount += 1;
    if state.sigchld_refcount == 1 {
        signal::register_raw_hook(libc::SIGCHLD, dispatch);
    }
    Ok(())
}

/// Wait for any child process to exit, returning `(pid, status)`.
pub fn wait_any(timeout_ms: i64) -> Result<(i32, i32)> {
    install_sigchld_relay()?;
    dispatch();

    {
        let mut guard = state();
        let state = guard.as_mut().unwrap();
        if let Some((&pid, &code)) = state.zombie_cache.iter().next() {
            state.zombie_cache.remove(&pid);
            return Ok((pid, code));
        }
        state.any_waiters.push(coroutine::current());
    }

    let result = event::suspend_with_timeout(Timeout::from_millis(timeout_ms));
    let mut guard = state();
    let state = guard.as_mut().unwrap();
    let me = coroutine::current();
    state.any_waiters.retain(|id| *id != me);
    if result.is_err() {
        return Err(result.unwrap_err());
    }
    // Whichever dispatch() pass woke us already populated the cache.
    for (&pid, &code) in state.zombie_cache.iter() {
        state.zombie_cache.remove(&pid);
        return Ok((pid, code));
    }
    Err(Error::new(Code::Eio, "wait_any woke with no reaped child"))
}

/// Wait for a specific child pid to exit, returning its status.
pub fn wait_pid(pid: i32, timeout_ms: i64) -> Result<i32> {
    if pid == 0 {
        return Err(Error::new(Code::Enotsup, "wait_pid with pid 0 is not supported yet"));
    }
    install_sigchld_relay()?;
    dispatch();

    {
        let mut guard = state();
        let state = guard.as_mut().unwrap();
        if let Some(code) = state.zombie_cache.remove(&pid) {
            return Ok(code);
        }
        let task = state.pid_tasks.entry(pid).or_insert_with(|| WaitpidTask { waiters: Vec::new(), status: None });
        task.waiters.push(coroutine::current());
    }

    let result = event::suspend_with_timeout(Timeout::from_millis(timeout_ms));
    let mut guard = state();
    let state = guard.as_mut().unwrap();
    let status = state.pid_tasks.get(&pid).and_then(|t| t.status);
    if let Some(task) = state.pid_tasks.get_mut(&pid) {
        let me = coroutine::current();
        task.waiters.retain(|id| *id != me);
        if task.waiters.is_empty() {
            state.pid_tasks.remove(&pid);
        }
    }
    result?;
    status.ok_or_else(|| Error::new(Code::Eio, "wait_pid woke with no status recorded"))
}

/// Register this process's interest in SIGCHLD explicitly, mirroring
/// `cat_os_wait.c`'s refcounted watcher start/stop; `wait_any`/`wait_pid`
/// already call this, exposed for callers that want to pre-arm it.
pub fn ensure_watcher() -> Result<()> {
    install_sigchld_relay()
}
