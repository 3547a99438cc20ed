//! Composite error type and the POSIX-equivalent error code taxonomy.
//!
//! Every fallible operation in this crate produces a [`Code`] plus a formatted
//! message, optionally chained to a prior cause. A thread-local mirrors the
//! classic C library "last error" side channel, since a few APIs here
//! (coroutine resume, channel push/pop) report failure through a side
//! channel rather than purely through `Result`.

use std::cell::RefCell;
use std::fmt;

use thiserror::Error;

/// The POSIX-equivalent error code set plus library-specific extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Code {
    // Argument errors
    Einval,
    Emisuse,
    Enotsup,
    // Resource errors
    Enomem,
    Emfile,
    Enfile,
    Enobufs,
    // I/O errors
    Eio,
    Epipe,
    Econnreset,
    Econnrefused,
    Econnaborted,
    Ehostunreach,
    Enetunreach,
    Ebadf,
    Eaddrinuse,
    Eacces,
    // Waiting/cancellation
    Etimedout,
    Ecanceled,
    Eagain,
    Ebusy,
    Elocked,
    Eclosed,
    Eclosing,
    // Protocol
    Essl,
    DuplicateContentType,
    MultipartHeader,
    MultipartBody,
    EaiNoname,
    // Process/signal
    Esrch,
    Echild,
    Eperm,
}

impl Code {
    /// Best-effort mapping from an OS `errno` value to our code set.
    pub fn from_errno(errno: i32) -> Code {
        match errno {
            libc::EINVAL => Code::Einval,
            libc::ENOMEM => Code::Enomem,
            libc::EMFILE => Code::Emfile,
            libc::ENFILE => Code::Enfile,
            libc::ENOBUFS => Code::Enobufs,
            libc::EIO => Code::Eio,
            libc::EPIPE => Code::Epipe,
            libc::ECONNRESET => Code::Econnreset,
            libc::ECONNREFUSED => Code::Econnrefused,
            libc::ECONNABORTED => Code::Econnaborted,
            libc::EHOSTUNREACH => Code::Ehostunreach,
            libc::ENETUNREACH => Code::Enetunreach,
            libc::EBADF => Code::Ebadf,
            libc::EADDRINUSE => Code::Eaddrinuse,
            libc::EACCES => Code::Eacces,
            libc::ETIMEDOUT => Code::Etimedout,
            libc::ECANCELED => Code::Ecanceled,
            libc::EAGAIN => Code::Eagain,
            libc::EBUSY => Code::Ebusy,
            libc::ESRCH => Code::Esrch,
            libc::ECHILD => Code::Echild,
            libc::EPERM => Code::Eperm,
            _ => Code::Eio,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A composite error: what was attempted, the code, and an optional cause.
#[derive(Debug, Error)]
#[error("{message} ({code})")]
pub struct Error {
    pub code: Code,
    pub message: String,
    #[source]
    pub cause: Option<Box<Error>>,
}

impl Error {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Error { code, message: message.into(), cause: None }
    }

    pub fn chained(code: Code, message: impl Into<String>, cause: Error) -> Self {
        Error { code, message: message.into(), cause: Some(Box::new(cause)) }
    }

    /// Record this error as the calling coroutine's last error and return it.
    pub fn record(self) -> Self {
        set_last_error(self.code, self.message.clone());
        self
    }
}

pub type Result<T> = std::result::Result<T, Error>;

thread_local! {
    static LAST_ERROR: RefCell<Option<(Code, String)>> = RefCell::new(None);
}

/// Mirrors `cat_update_last_error`: records a code+message pair that later
/// callers (e.g. `cat_coroutine_resume_standard`, which reports failure via
/// a side channel plus a plain bool) can retrieve without threading a
/// `Result` through every layer.
pub fn set_last_error(code: Code, message: impl Into<String>) {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = Some((code, message.into())));
}

pub fn set_last_error_with_previous(message: impl Into<String>) {
    let previous = last_error_message();
    let combined = match previous {
        Some(prev) => format!("{}: {}", message.into(), prev),
        None => message.into(),
    };
    let code = last_error_code().unwrap_or(Code::Eio);
    set_last_error(code, combined);
}

pub fn last_error_code() -> Option<Code> {
    LAST_ERROR.with(|cell| cell.borrow().as_ref().map(|(c, _)| *c))
}

pub fn last_error_message() -> Option<String> {
    LAST_ERROR.with(|cell| cell.borrow().as_ref().map(|(_, m)| m.clone()))
}

pub fn clear_last_error() {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_reads_last_error() {
        clear_last_error();
        set_last_error(Code::Etimedout, "connect timed out");
        assert_eq!(last_error_code(), Some(Code::Etimedout));
        assert_eq!(last_error_message().as_deref(), Some("connect timed out"));
    }

    #[test]
    fn chains_previous_message() {
        clear_last_error();
        set_last_error(Code::Econnreset, "peer reset");
        set_last_error_with_previous("read failed");
        assert_eq!(last_error_message().as_deref(), Some("read failed: peer reset"));
    }
}
