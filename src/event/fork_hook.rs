//! POSIX `fork()` integration: the child inherits the parent's
//! `mio::Poll` fd, epoll/kqueue state that makes no sense after a fork,
//! so it must discard the reactor and build a fresh one before doing
//! anything else with it.

use nix::unistd::ForkResult;

use crate::error::{Code, Error, Result};
use crate::event;

/// Wraps `nix::unistd::fork`; the child runs `event_fork()` before
/// returning so it never touches the parent's stale reactor state.
///
/// # Safety
/// Same constraints as `libc::fork`/`nix::unistd::fork`: async-signal-safe
/// code only until the child calls something that re-establishes a sane
/// environment (which `event_fork` does for this crate's own state).
pub unsafe fn fork() -> Result<ForkResult> {
    let result = nix::unistd::fork().map_err(|e| Error::new(Code::Eio, format!("fork() failed: {}", e)))?;
    if let ForkResult::Child = result {
        event_fork();
    }
    Ok(result)
}

/// Discards this thread's reactor and every pending coroutine-runtime
/// registration inherited from the parent, then builds a fresh reactor.
/// Must be the first thing the child calls after `fork()`.
pub fn event_fork() {
    event::reset_reactor();
    crate::runtime::reset();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_and_reap_child() {
        if crate::log::cfg::offline() {
            return;
        }
        let result = unsafe { fork() };
        match result {
            Ok(ForkResult::Child) => {
                std::process::exit(0);
            }
            Ok(ForkResult::Parent { child }) => {
                let status = nix::sys::wait::waitpid(child, None);
                assert!(status.is_ok());
            }
            Err(_) => {}
        }
    }
}
