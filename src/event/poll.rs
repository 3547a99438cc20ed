//! `poll(2)`-style readiness waiting over raw file descriptors: translates
//! POSIX `POLLIN`/`POLLOUT` into the reactor's readable/writable events.

use std::os::unix::io::RawFd;

use mio::unix::SourceFd;
use mio::Interest;

use crate::error::Result;
use crate::event::{self, Timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvents(i32);

impl PollEvents {
    pub const POLLIN: PollEvents = PollEvents(0x001);
    pub const POLLPRI: PollEvents = PollEvents(0x002);
    pub const POLLOUT: PollEvents = PollEvents(0x004);
    pub const POLLERR: PollEvents = PollEvents(0x008);
    pub const POLLHUP: PollEvents = PollEvents(0x010);

    pub fn empty() -> PollEvents {
        PollEvents(0)
    }

    pub fn contains(self, other: PollEvents) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for PollEvents {
    type Output = PollEvents;
    fn bitor(self, rhs: PollEvents) -> PollEvents {
        PollEvents(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for PollEvents {
    fn bitor_assign(&mut self, rhs: PollEvents) {
        self.0 |= rhs.0;
    }
}

fn to_interest(events: PollEvents) -> Interest {
    let mut interest = None;
    if events.contains(PollEvents::POLLIN) || events.contains(PollEvents::POLLPRI) {
        interest = Some(Interest::READABLE);
    }
    if events.contains(PollEvents::POLLOUT) {
        interest = Some(interest.map_or(Interest::WRITABLE, |i| i | Interest::WRITABLE));
    }
    interest.unwrap_or(Interest::READABLE)
}

fn from_readiness(r: event::IoReadiness) -> PollEvents {
    let mut out = PollEvents::empty();
    if r.readable {
        out |= PollEvents::POLLIN;
    }
    if r.writable {
        out |= PollEvents::POLLOUT;
    }
    if r.error {
        out |= PollEvents::POLLERR;
    }
    if r.closed {
        out |= PollEvents::POLLHUP;
    }
    out
}

/// Wait for `events` to become ready on `fd`, or until `timeout_ms` elapses
/// (negative = forever, zero = poll once and return immediately). The
/// returned `PollEvents` is whatever `mio` actually observed, which may
/// differ from what was requested (e.g. `POLLERR`/`POLLHUP` on a dead fd).
pub fn poll_one(fd: RawFd, events: PollEvents, timeout_ms: i64) -> Result<PollEvents> {
    let mut source = SourceFd(&fd);
    let token = event::register_io(&mut source, to_interest(events))?;

    let timeout = Timeout::from_millis(timeout_ms);
    let result = event::suspend_with_timeout(timeout);
    let observed = from_readiness(event::io_readiness(token));
    event::deregister_io(&mut source, token);

    result.map(|_| observed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_readable_roundtrips() {
        let events = PollEvents::POLLIN | PollEvents::POLLOUT;
        assert_eq!(to_interest(events), Interest::READABLE | Interest::WRITABLE);
    }

    #[test]
    fn observed_readiness_is_reported_verbatim_not_the_request() {
        // A dead socket: hung up and erroring, neither readable nor
        // writable. The translated `PollEvents` must reflect exactly that,
        // regardless of what interest the caller originally registered.
        let observed = from_readiness(event::IoReadiness { readable: false, writable: false, error: true, closed: true });
        assert!(observed.contains(PollEvents::POLLERR));
        assert!(observed.contains(PollEvents::POLLHUP));
        assert!(!observed.contains(PollEvents::POLLIN));
        assert!(!observed.contains(PollEvents::POLLOUT));
    }
}
