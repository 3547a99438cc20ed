//! POSIX signal waiting: wait for a signal to arrive without installing a
//! blocking `sigwait()` call on the runtime's one and only thread.
//!
//! Classic self-pipe trick: a single process-wide handler (async-signal-safe:
//! it only writes one byte) feeds a `mio::unix::pipe`, which the reactor
//! registers like any other I/O source (`event::mod`'s `SIGNAL_TOKEN`). The
//! same shared-watcher-plus-waiter-list pattern as `event::process`'s
//! SIGCHLD handling, generalized to arbitrary signals.

use std::collections::HashMap;
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;

use mio::unix::pipe;
use nix::sys::signal::Signal;

use crate::coroutine::{self, Id};
use crate::error::{Code, Error, Result};
use crate::event::{self, Timeout};

static WRITE_FD: AtomicI32 = AtomicI32::new(-1);
static HANDLERS_INSTALLED: AtomicBool = AtomicBool::new(false);
static WAITERS: Mutex<Option<HashMap<i32, Vec<Id>>>> = Mutex::new(None);
static RAW_HOOKS: Mutex<Option<HashMap<i32, Vec<fn()>>>> = Mutex::new(None);

/// Registers a plain callback to run synchronously, on the reactor's own
/// thread, every time `signum` is relayed through the self-pipe — used by
/// `event::process` to drive SIGCHLD-triggered `waitpid()` dispatch without
/// a numbered waiter of its own.
pub(crate) fn register_raw_hook(signum: i32, hook: fn()) {
    let mut guard = RAW_HOOKS.lock().unwrap();
    guard.get_or_insert_with(HashMap::new).entry(signum).or_default().push(hook);
}

const WATCHED: &[Signal] = &[Signal::SIGINT, Signal::SIGTERM, Signal::SIGUSR1, Signal::SIGUSR2, Signal::SIGCHLD];

extern "C" fn relay(signum: libc::c_int) {
    let fd = WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = [signum as u8];
        unsafe {
            libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

fn rejects(sig: Signal) -> bool {
    matches!(sig, Signal::SIGKILL | Signal::SIGSTOP)
}

/// Called once by `Reactor::ensure_signal_pipe` with the pipe's write end.
/// We leak it deliberately: the signal handler needs a stable fd for the
/// lifetime of the process, and there is exactly one self-pipe per process.
pub(crate) fn install_sender(sender: pipe::Sender) {
    WRITE_FD.store(sender.as_raw_fd(), Ordering::Relaxed);
    std::mem::forget(sender);

    if HANDLERS_INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    *WAITERS.lock().unwrap() = Some(HashMap::new());
    for sig in WATCHED {
        unsafe {
            let action = nix::sys::signal::SigAction::new(
                nix::sys::signal::SigHandler::Handler(relay),
                nix::sys::signal::SaFlags::SA_RESTART,
                nix::sys::signal::SigSet::empty(),
            );
            let _ = nix::sys::signal::sigaction(*sig, &action);
        }
    }
}

/// Called by `event::wait` when the self-pipe's read end is readable:
/// drain every queued byte and wake whoever is waiting on that signal.
pub(crate) fn drain_and_dispatch() {
    let delivered: Vec<u8> = event::with_reactor(|r| {
        let mut buf = [0u8; 64];
        let mut out = Vec::new();
        if let Some(receiver) = r.signal_receiver_mut() {
            loop {
                match receiver.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => out.extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }
        }
        out
    });

    for byte in &delivered {
        let signum = *byte as i32;
        let hooks = RAW_HOOKS.lock().unwrap().as_ref().and_then(|m| m.get(&signum).cloned());
        if let Some(hooks) = hooks {
            for hook in hooks {
                hook();
            }
        }
    }

    let mut guard = WAITERS.lock().unwrap();
    let Some(map) = guard.as_mut() else { return };
    for byte in delivered {
        if let Some(waiters) = map.remove(&(byte as i32)) {
            for id in waiters {
                let _ = coroutine::resume(id, 0);
            }
        }
    }
}

/// Wait for `signum` to be delivered to this process, or until `timeout`.
pub fn wait(signum: i32, timeout_ms: i64) -> Result<()> {
    let sig = Signal::try_from(signum).map_err(|_| Error::new(Code::Einval, "unknown signal number"))?;
    if rejects(sig) {
        return Err(Error::new(Code::Einval, "SIGKILL/SIGSTOP cannot be caught"));
    }
    event::with_reactor(|r| r.ensure_signal_pipe())?;

    let me = coroutine::current();
    WAITERS.lock().unwrap().as_mut().unwrap().entry(signum).or_default().push(me);

    let timeout = Timeout::from_millis(timeout_ms);
    let result = event::suspend_with_timeout(timeout);
    if result.is_err() {
        if let Some(list) = WAITERS.lock().unwrap().as_mut().unwrap().get_mut(&signum) {
            list.retain(|id| *id != me);
        }
    }
    result.map(|_| ())
}

/// Send `signum` to process `pid`.
pub fn kill(pid: i32, signum: i32) -> Result<()> {
    let sig = Signal::try_from(signum).map_err(|_| Error::new(Code::Einval, "unknown signal number"))?;
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), sig)
        .map_err(|e| Error::new(Code::Eio, format!("kill({}, {:?}) failed: {}", pid, sig, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_sigkill() {
        assert!(wait(libc::SIGKILL, 0).is_err());
    }

    #[test]
    fn rejects_unknown_signum() {
        assert!(wait(9999, 0).is_err());
    }
}
