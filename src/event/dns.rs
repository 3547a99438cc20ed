//! DNS lookup adapter.
//!
//! `mio` has no native async resolver. Resolved the same way the rest of
//! this crate bridges any blocking syscall that has no readiness-based
//! equivalent: dispatch onto the worker pool and await the result like
//! any other adapter.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crate::error::{Code, Error, Result};
use crate::event::work::{self, WorkKind};

/// Resolve `host:port` to a list of socket addresses, off the coroutine's
/// own stack so a slow resolver can't stall the single-threaded runtime.
pub fn lookup(host: &str, port: u16, timeout_ms: i64) -> Result<Vec<SocketAddr>> {
    let owned_host = host.to_string();
    let timeout = if timeout_ms < 0 { None } else { Some(Duration::from_millis(timeout_ms as u64)) };

    let result = work::dispatch(WorkKind::SlowIo, timeout, move || {
        (owned_host.as_str(), port)
            .to_socket_addrs()
            .map(|iter| iter.collect::<Vec<_>>())
            .map_err(|e| Error::new(Code::EaiNoname, format!("DNS lookup for {} failed: {}", owned_host, e)))
    })?;

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_localhost() {
        if crate::log::cfg::offline() {
            return;
        }
        let id = crate::coroutine::create(0, || {
            let addrs = lookup("localhost", 0, -1).unwrap();
            assert!(!addrs.is_empty());
        })
        .unwrap();
        crate::coroutine::resume(id, 0).unwrap();
        let start = std::time::Instant::now();
        while crate::coroutine::active_count() > 1 && start.elapsed() < Duration::from_secs(2) {
            let _ = crate::event::wait(Some(Duration::from_millis(20)));
        }
    }
}
