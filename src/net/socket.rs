//! Socket engine: a synchronous-looking byte-stream/datagram API over the
//! `event` bridge. One `Socket` wraps exactly one OS fd;
//! every suspending operation registers interest with the reactor, yields,
//! and is resumed either by reactor readiness or by `close()`/cancel.

use std::cell::{Cell, RefCell};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::Path;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::unix::SourceFd;
use mio::{Interest, Token};

use crate::coroutine::{self, Id};
use crate::error::{Code, Error, Result};
use crate::event::{self, Timeout};
use crate::net::addr::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimpleType {
    Tcp,
    Udp,
    Pipe,
    Udg,
    Tty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketState {
    Unopen,
    Open,
    Listening,
    Established,
    Closed,
}

enum IoHandle {
    None,
    TcpListener(TcpListener),
    TcpStream(TcpStream),
    Udp(UdpSocket),
    UnixListener(mio::net::UnixListener),
    UnixStream(mio::net::UnixStream),
}

impl IoHandle {
    fn raw_fd(&self) -> i32 {
        match self {
            IoHandle::None => -1,
            IoHandle::TcpListener(s) => s.as_raw_fd(),
            IoHandle::TcpStream(s) => s.as_raw_fd(),
            IoHandle::Udp(s) => s.as_raw_fd(),
            IoHandle::UnixListener(s) => s.as_raw_fd(),
            IoHandle::UnixStream(s) => s.as_raw_fd(),
        }
    }

    fn register(&mut self, interest: Interest) -> Result<Token> {
        match self {
            IoHandle::None => Err(Error::new(Code::Ebadf, "socket has no fd to register")),
            IoHandle::TcpListener(s) => event::register_io(s, interest),
            IoHandle::TcpStream(s) => event::register_io(s, interest),
            IoHandle::Udp(s) => event::register_io(s, interest),
            IoHandle::UnixListener(s) => event::register_io(s, interest),
            IoHandle::UnixStream(s) => event::register_io(s, interest),
        }
    }

    fn deregister(&mut self, token: Token) {
        match self {
            IoHandle::None => {}
            IoHandle::TcpListener(s) => event::deregister_io(s, token),
            IoHandle::TcpStream(s) => event::deregister_io(s, token),
            IoHandle::Udp(s) => event::deregister_io(s, token),
            IoHandle::UnixListener(s) => event::deregister_io(s, token),
            IoHandle::UnixStream(s) => event::deregister_io(s, token),
        }
    }
}

/// A socket handle. Not `Send`/`Sync`: objects never migrate across
/// runtimes.
pub struct Socket {
    kind: SimpleType,
    state: Cell<SocketState>,
    io: RefCell<IoHandle>,
    local_cache: RefCell<Option<Address>>,
    peer_cache: RefCell<Option<Address>>,
    read_timeout_ms: Cell<i64>,
    write_timeout_ms: Cell<i64>,
    reader: Cell<Option<Id>>,
    writer: Cell<Option<Id>>,
}

impl Socket {
    pub fn create(kind: SimpleType) -> Result<Socket> {
        Ok(Socket {
            kind,
            state: Cell::new(SocketState::Unopen),
            io: RefCell::new(IoHandle::None),
            local_cache: RefCell::new(None),
            peer_cache: RefCell::new(None),
            read_timeout_ms: Cell::new(-1),
            write_timeout_ms: Cell::new(-1),
            reader: Cell::new(None),
            writer: Cell::new(None),
        })
    }

    pub fn kind(&self) -> SimpleType {
        self.kind
    }

    pub fn set_read_timeout(&self, ms: i64) {
        self.read_timeout_ms.set(ms);
    }

    pub fn set_write_timeout(&self, ms: i64) {
        self.write_timeout_ms.set(ms);
    }

    fn socket2(&self) -> socket2::Socket {
        let fd = self.io.borrow().raw_fd();
        unsafe { socket2::Socket::from_raw_fd(fd) }
    }

    /// Binds to `addr`. `reuseaddr`/`reuseport` select `SO_REUSEADDR`/
    /// `SO_REUSEPORT` before the socket binds.
    pub fn bind(&self, addr: &str, reuseaddr: bool, reuseport: bool) -> Result<()> {
        if self.state.get() != SocketState::Unopen {
            return Err(Error::new(Code::Emisuse, "bind on a socket that is already open"));
        }
        match self.kind {
            SimpleType::Tcp => {
                let parsed: SocketAddr = addr.parse().map_err(|_| Error::new(Code::Einval, "invalid TCP bind address"))?;
                let socket = socket2::Socket::new(
                    socket2::Domain::for_address(parsed),
                    socket2::Type::STREAM,
                    Some(socket2::Protocol::TCP),
                )
                .map_err(|e| Error::new(Code::Eio, format!("socket() failed: {}", e)))?;
                socket.set_reuse_address(reuseaddr).ok();
                #[cfg(unix)]
                socket.set_reuse_port(reuseport).ok();
                let _ = reuseport;
                socket
                    .bind(&parsed.into())
                    .map_err(|e| Error::new(Code::from_errno(e.raw_os_error().unwrap_or(0)), format!("bind() failed: {}", e)))?;
                socket.set_nonblocking(true).ok();
                let std_listener: std::net::TcpListener = socket.into();
                *self.io.borrow_mut() = IoHandle::TcpListener(TcpListener::from_std(std_listener));
            }
            SimpleType::Udp => {
                let parsed: SocketAddr = addr.parse().map_err(|_| Error::new(Code::Einval, "invalid UDP bind address"))?;
                let socket = UdpSocket::bind(parsed).map_err(|e| Error::new(Code::Eio, format!("UDP bind() failed: {}", e)))?;
                *self.io.borrow_mut() = IoHandle::Udp(socket);
            }
            SimpleType::Pipe | SimpleType::Udg => {
                let path = Path::new(addr);
                let _ = std::fs::remove_file(path);
                let listener = mio::net::UnixListener::bind(path).map_err(|e| Error::new(Code::Eio, format!("unix bind() failed: {}", e)))?;
                *self.io.borrow_mut() = IoHandle::UnixListener(listener);
            }
            SimpleType::Tty => return Err(Error::new(Code::Enotsup, "bind() is not meaningful for a TTY socket")),
        }
        self.state.set(SocketState::Open);
        self.local_cache.replace(None);
        Ok(())
    }

    pub fn listen(&self, _backlog: i32) -> Result<()> {
        if self.state.get() != SocketState::Open {
            return Err(Error::new(Code::Einval, "listen() requires a bound, unopened-for-listen socket"));
        }
        self.state.set(SocketState::Listening);
        Ok(())
    }

    pub fn accept(&self, timeout_ms: i64) -> Result<Socket> {
        if self.state.get() != SocketState::Listening {
            return Err(Error::new(Code::Einval, "accept() requires a listening socket"));
        }
        loop {
            let accepted = match &mut *self.io.borrow_mut() {
                IoHandle::TcpListener(listener) => listener.accept().map(|(stream, addr)| (IoHandle::TcpStream(stream), Address::Ip(addr))),
                IoHandle::UnixListener(listener) => listener.accept().map(|(stream, _)| (IoHandle::UnixStream(stream), Address::None)),
                _ => return Err(Error::new(Code::Einval, "accept() on a non-listening-capable socket")),
            };
            match accepted {
                Ok((io, peer)) => {
                    return Ok(Socket {
                        kind: self.kind,
                        state: Cell::new(SocketState::Established),
                        io: RefCell::new(io),
                        local_cache: RefCell::new(None),
                        peer_cache: RefCell::new(Some(peer)),
                        read_timeout_ms: Cell::new(-1),
                        write_timeout_ms: Cell::new(-1),
                        reader: Cell::new(None),
                        writer: Cell::new(None),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.suspend_for(Interest::READABLE, Timeout::from_millis(timeout_ms))?;
                }
                Err(e) => return Err(Error::new(Code::from_errno(e.raw_os_error().unwrap_or(0)), format!("accept() failed: {}", e))),
            }
        }
    }

    pub fn connect(&self, host: &str, port: u16, timeout_ms: i64) -> Result<()> {
        if self.state.get() != SocketState::Unopen {
            return Err(Error::new(Code::Emisuse, "connect() on an already-open socket"));
        }
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::new(Code::EaiNoname, format!("DNS resolution for {} failed: {}", host, e)))?
            .collect::<Vec<_>>();
        let addr = *addrs.first().ok_or_else(|| Error::new(Code::EaiNoname, "no addresses resolved"))?;

        match self.kind {
            SimpleType::Tcp => {
                let stream = TcpStream::connect(addr).map_err(|e| Error::new(Code::Eio, format!("connect() failed: {}", e)))?;
                *self.io.borrow_mut() = IoHandle::TcpStream(stream);
            }
            _ => return Err(Error::new(Code::Enotsup, "connect() is only implemented for TCP")),
        }
        self.state.set(SocketState::Open);
        self.suspend_for(Interest::WRITABLE, Timeout::from_millis(timeout_ms))?;

        if let IoHandle::TcpStream(stream) = &*self.io.borrow() {
            if let Err(e) = stream.take_error() {
                return Err(Error::new(Code::Econnrefused, format!("connect() failed: {}", e)));
            }
        }
        self.state.set(SocketState::Established);
        self.peer_cache.replace(Some(Address::Ip(addr)));
        Ok(())
    }

    fn suspend_for(&self, interest: Interest, timeout: Timeout) -> Result<()> {
        let token = self.io.borrow_mut().register(interest)?;
        let result = event::suspend_with_timeout(timeout);
        self.io.borrow_mut().deregister(token);
        result.map(|_| ())
    }

    /// Reads into `buf`. Returns `0` on stream EOF.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.lock_reader()?;
        let result = self.read_inner(buf);
        self.reader.set(None);
        result
    }

    fn read_inner(&self, buf: &mut [u8]) -> Result<usize> {
        let timeout = Timeout::from_millis(self.read_timeout_ms.get());
        loop {
            let attempt = match &mut *self.io.borrow_mut() {
                IoHandle::TcpStream(s) => s.read(buf),
                IoHandle::UnixStream(s) => s.read(buf),
                IoHandle::Udp(_) => return Err(Error::new(Code::Einval, "use recv_from() on a datagram socket")),
                _ => return Err(Error::new(Code::Ebadf, "read() on an unopened/closed socket")),
            };
            match attempt {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.suspend_for(Interest::READABLE, timeout)?,
                Err(e) => return Err(Error::new(Code::Econnreset, format!("read() failed: {}", e))),
            }
        }
    }

    /// Writes all of `buf`, or returns an error — never a short write.
    pub fn write(&self, buf: &[u8]) -> Result<()> {
        self.lock_writer()?;
        let result = self.write_inner(buf);
        self.writer.set(None);
        result
    }

    fn write_inner(&self, buf: &[u8]) -> Result<()> {
        let timeout = Timeout::from_millis(self.write_timeout_ms.get());
        let mut written = 0;
        while written < buf.len() {
            let attempt = match &mut *self.io.borrow_mut() {
                IoHandle::TcpStream(s) => s.write(&buf[written..]),
                IoHandle::UnixStream(s) => s.write(&buf[written..]),
                IoHandle::Udp(_) => return Err(Error::new(Code::Einval, "use send_to() on a datagram socket")),
                _ => return Err(Error::new(Code::Ebadf, "write() on an unopened/closed socket")),
            };
            match attempt {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.suspend_for(Interest::WRITABLE, timeout)?,
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Err(Error::new(Code::Epipe, "write() failed: broken pipe")),
                Err(e) => return Err(Error::new(Code::Eio, format!("write() failed: {}", e))),
            }
        }
        Ok(())
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
        let timeout = Timeout::from_millis(self.read_timeout_ms.get());
        loop {
            let attempt = match &*self.io.borrow() {
                IoHandle::Udp(s) => s.recv_from(buf),
                _ => return Err(Error::new(Code::Einval, "recv_from() requires a datagram socket")),
            };
            match attempt {
                Ok((n, addr)) => return Ok((n, Address::Ip(addr))),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.suspend_for(Interest::READABLE, timeout)?,
                Err(e) => return Err(Error::new(Code::Eio, format!("recv_from() failed: {}", e))),
            }
        }
    }

    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize> {
        let timeout = Timeout::from_millis(self.write_timeout_ms.get());
        loop {
            let attempt = match &*self.io.borrow() {
                IoHandle::Udp(s) => s.send_to(buf, addr),
                _ => return Err(Error::new(Code::Einval, "send_to() requires a datagram socket")),
            };
            match attempt {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.suspend_for(Interest::WRITABLE, timeout)?,
                Err(e) => return Err(Error::new(Code::Eio, format!("send_to() failed: {}", e))),
            }
        }
    }

    fn lock_reader(&self) -> Result<()> {
        if self.reader.get().is_some() {
            return Err(Error::new(Code::Elocked, "a second coroutine is already reading this socket"));
        }
        self.reader.set(Some(coroutine::current()));
        Ok(())
    }

    fn lock_writer(&self) -> Result<()> {
        if self.writer.get().is_some() {
            return Err(Error::new(Code::Elocked, "a second coroutine is already writing this socket"));
        }
        self.writer.set(Some(coroutine::current()));
        Ok(())
    }

    /// Non-suspending liveness check.
    pub fn check_liveness(&self) -> bool {
        matches!(self.state.get(), SocketState::Open | SocketState::Listening | SocketState::Established)
    }

    /// Closes the socket. Every coroutine suspended in an op on this
    /// socket resumes with `ECANCELED`, not `EBADF`.
    pub fn close(&self) {
        self.state.set(SocketState::Closed);
        if let Some(id) = self.reader.take() {
            let _ = coroutine::resume(id, Code::Ecanceled as usize);
        }
        if let Some(id) = self.writer.take() {
            let _ = coroutine::resume(id, Code::Ecanceled as usize);
        }
        *self.io.borrow_mut() = IoHandle::None;
    }

    pub fn local_addr(&self) -> Result<Address> {
        if let Some(cached) = self.local_cache.borrow().clone() {
            return Ok(cached);
        }
        let addr = match &*self.io.borrow() {
            IoHandle::TcpListener(s) => Address::Ip(s.local_addr().map_err(|e| Error::new(Code::Eio, e.to_string()))?),
            IoHandle::TcpStream(s) => Address::Ip(s.local_addr().map_err(|e| Error::new(Code::Eio, e.to_string()))?),
            IoHandle::Udp(s) => Address::Ip(s.local_addr().map_err(|e| Error::new(Code::Eio, e.to_string()))?),
            _ => Address::None,
        };
        self.local_cache.replace(Some(addr.clone()));
        Ok(addr)
    }

    pub fn peer_addr(&self) -> Result<Address> {
        if let Some(cached) = self.peer_cache.borrow().clone() {
            return Ok(cached);
        }
        let addr = match &*self.io.borrow() {
            IoHandle::TcpStream(s) => Address::Ip(s.peer_addr().map_err(|e| Error::new(Code::Eio, e.to_string()))?),
            _ => Address::None,
        };
        self.peer_cache.replace(Some(addr.clone()));
        Ok(addr)
    }

    /// Setting `size == 0` requests a sensible default: one page.
    pub fn set_recv_buffer_size(&self, size: usize) -> Result<()> {
        let size = if size == 0 { page_size() } else { size };
        self.socket2_op(|s| s.set_recv_buffer_size(size))
    }

    pub fn set_send_buffer_size(&self, size: usize) -> Result<()> {
        let size = if size == 0 { page_size() } else { size };
        self.socket2_op(|s| s.set_send_buffer_size(size))
    }

    pub fn set_nodelay(&self, enabled: bool) -> Result<()> {
        self.socket2_op(|s| s.set_tcp_nodelay(enabled))
    }

    pub fn set_keepalive(&self, enabled: bool) -> Result<()> {
        self.socket2_op(|s| s.set_keepalive(enabled))
    }

    fn socket2_op(&self, f: impl FnOnce(&socket2::Socket) -> io::Result<()>) -> Result<()> {
        let owned = self.socket2();
        let result = f(&owned);
        std::mem::forget(owned);
        result.map_err(|e| Error::new(Code::from_errno(e.raw_os_error().unwrap_or(0)), format!("setsockopt failed: {}", e)))
    }
}

fn page_size() -> usize {
    4096
}

impl Drop for Socket {
    fn drop(&mut self) {
        if self.state.get() != SocketState::Closed {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_echo_roundtrip() {
        let server = Socket::create(SimpleType::Tcp).unwrap();
        server.bind("127.0.0.1:0", true, false).unwrap();
        server.listen(128).unwrap();
        let server_addr = server.local_addr().unwrap();

        let server_id = coroutine::create(0, move || {
            let conn = server.accept(-1).unwrap();
            let mut buf = [0u8; 5];
            let n = conn.read(&mut buf).unwrap();
            conn.write(&buf[..n]).unwrap();
        })
        .unwrap();
        coroutine::resume(server_id, 0).unwrap();

        let client_id = coroutine::create(0, move || {
            let port = server_addr.as_ip().unwrap().port();
            let client = Socket::create(SimpleType::Tcp).unwrap();
            client.connect("127.0.0.1", port, -1).unwrap();
            client.write(b"hello").unwrap();
            let mut buf = [0u8; 5];
            let n = client.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"hello");
        })
        .unwrap();
        coroutine::resume(client_id, 0).unwrap();

        let start = std::time::Instant::now();
        while coroutine::active_count() > 1 && start.elapsed() < Duration::from_secs(2) {
            let _ = event::wait(Some(Duration::from_millis(20)));
        }
        assert_eq!(coroutine::active_count(), 1);
    }
}
