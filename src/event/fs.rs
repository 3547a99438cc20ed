//! File-system adapter. There's no portable non-blocking filesystem API
//! on a `mio` reactor, so every operation here dispatches onto
//! `event::work`'s worker pool — a thread actually performs the blocking
//! syscall while the reactor goes on driving I/O for everyone else.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Code, Error, Result};
use crate::event::work::{self, WorkKind};

fn io_err(op: &str, path: &Path, e: io::Error) -> Error {
    let code = e.raw_os_error().map(Code::from_errno).unwrap_or(Code::Eio);
    Error::new(code, format!("{} {} failed: {}", op, path.display(), e))
}

pub fn read(path: impl AsRef<Path>, timeout_ms: i64) -> Result<Vec<u8>> {
    let path: PathBuf = path.as_ref().to_path_buf();
    let timeout = if timeout_ms < 0 { None } else { Some(Duration::from_millis(timeout_ms as u64)) };
    work::dispatch(WorkKind::SlowIo, timeout, move || fs::read(&path).map_err(|e| io_err("read", &path, e)))?
}

pub fn write(path: impl AsRef<Path>, contents: Vec<u8>, timeout_ms: i64) -> Result<()> {
    let path: PathBuf = path.as_ref().to_path_buf();
    let timeout = if timeout_ms < 0 { None } else { Some(Duration::from_millis(timeout_ms as u64)) };
    work::dispatch(WorkKind::SlowIo, timeout, move || fs::write(&path, &contents).map_err(|e| io_err("write", &path, e)))?
}

pub fn stat(path: impl AsRef<Path>, timeout_ms: i64) -> Result<fs::Metadata> {
    let path: PathBuf = path.as_ref().to_path_buf();
    let timeout = if timeout_ms < 0 { None } else { Some(Duration::from_millis(timeout_ms as u64)) };
    work::dispatch(WorkKind::FastIo, timeout, move || fs::metadata(&path).map_err(|e| io_err("stat", &path, e)))?
}

pub fn remove_file(path: impl AsRef<Path>, timeout_ms: i64) -> Result<()> {
    let path: PathBuf = path.as_ref().to_path_buf();
    let timeout = if timeout_ms < 0 { None } else { Some(Duration::from_millis(timeout_ms as u64)) };
    work::dispatch(WorkKind::FastIo, timeout, move || fs::remove_file(&path).map_err(|e| io_err("unlink", &path, e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrips() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("cat-rt-fs-test-{}.txt", std::process::id()));

        let id = crate::coroutine::create(0, {
            let path = path.clone();
            move || {
                write(&path, b"hello".to_vec(), -1).unwrap();
                let bytes = read(&path, -1).unwrap();
                assert_eq!(bytes, b"hello");
                remove_file(&path, -1).unwrap();
            }
        })
        .unwrap();
        crate::coroutine::resume(id, 0).unwrap();

        let start = std::time::Instant::now();
        while crate::coroutine::active_count() > 1 && start.elapsed() < Duration::from_secs(2) {
            let _ = crate::event::wait(Some(Duration::from_millis(20)));
        }
        assert_eq!(crate::coroutine::active_count(), 1);
    }
}
