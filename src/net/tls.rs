//! TLS record pump: layers encryption above [`crate::net::socket::Socket`]
//! without changing its read/write contract. Grounded in `openssl`'s BIO-pair
//! idiom — an in-memory [`BioPair`] stands in for the wire, and ciphertext is
//! pumped between it and the real socket explicitly, so every suspend still
//! goes through the socket's own `read`/`write` (and therefore the reactor).

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::rc::Rc;

use openssl::ssl::{
    ErrorCode, HandshakeError, MidHandshakeSslStream, Ssl, SslContext, SslStream,
};

use crate::error::{Code, Error, Result};
use crate::net::socket::Socket;

/// The in-memory transport `openssl` reads/writes ciphertext against.
/// Never touches the real socket itself; [`TlsEngine::pump`] does that.
struct BioPair {
    inbound: VecDeque<u8>,
    outbound: VecDeque<u8>,
}

impl BioPair {
    fn new() -> BioPair {
        BioPair { inbound: VecDeque::new(), outbound: VecDeque::new() }
    }
}

impl Read for BioPair {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.inbound.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no ciphertext buffered yet"));
        }
        let n = self.inbound.len().min(buf.len());
        for (slot, byte) in buf[..n].iter_mut().zip(self.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for BioPair {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outbound.extend(buf.iter().copied());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Accept,
    Connect,
}

enum Stage {
    Idle(Ssl),
    Handshaking(MidHandshakeSslStream<BioPair>),
    Handshaked(SslStream<BioPair>),
}

/// A TLS session layered over one [`Socket`].
pub struct TlsEngine {
    socket: Rc<Socket>,
    role: Role,
    stage: Stage,
}

impl TlsEngine {
    pub fn new(socket: Rc<Socket>, ctx: &SslContext, role: Role) -> Result<TlsEngine> {
        let ssl = Ssl::new(ctx).map_err(|e| ssl_stack_error("failed to create SSL session", &e.to_string()))?;
        Ok(TlsEngine { socket, role, stage: Stage::Idle(ssl) })
    }

    /// Switches accept↔connect before the handshake has started. Any
    /// attempt after `HANDSHAKED` is a misuse error.
    pub fn set_role(&mut self, role: Role) -> Result<()> {
        if !matches!(self.stage, Stage::Idle(_)) {
            return Err(Error::new(Code::Emisuse, "cannot switch TLS role after the handshake has started"));
        }
        self.role = role;
        Ok(())
    }

    pub fn is_handshaked(&self) -> bool {
        matches!(self.stage, Stage::Handshaked(_))
    }

    /// Drives the handshake to completion, suspending the calling coroutine
    /// on real socket I/O whenever the TLS library wants more ciphertext or
    /// needs to flush what it produced.
    pub fn handshake(&mut self, timeout_ms: i64) -> Result<()> {
        loop {
            let stage = std::mem::replace(&mut self.stage, Stage::Idle(placeholder_ssl()));
            let outcome = match stage {
                Stage::Idle(ssl) => {
                    let bio = BioPair::new();
                    match self.role {
                        Role::Accept => ssl.accept(bio),
                        Role::Connect => ssl.connect(bio),
                    }
                }
                Stage::Handshaking(mid) => mid.handshake(),
                Stage::Handshaked(stream) => {
                    self.stage = Stage::Handshaked(stream);
                    return Ok(());
                }
            };

            match outcome {
                Ok(stream) => {
                    self.stage = Stage::Handshaked(stream);
                    return Ok(());
                }
                Err(HandshakeError::WouldBlock(mid)) => {
                    let wants_write = !mid.get_ref().outbound.is_empty();
                    self.stage = Stage::Handshaking(mid);
                    self.pump(wants_write, timeout_ms)?;
                }
                Err(HandshakeError::SetupFailure(e)) => {
                    return Err(ssl_stack_error("TLS handshake setup failed", &e.to_string()));
                }
                Err(HandshakeError::Failure(mid)) => {
                    let message = mid.error().to_string();
                    return Err(ssl_stack_error("TLS handshake failed", &message));
                }
            }
        }
    }

    /// Decrypts into `buf`, pulling ciphertext from the
    /// socket whenever the engine asks for more.
    pub fn read(&mut self, buf: &mut [u8], timeout_ms: i64) -> Result<usize> {
        self.ensure_handshaked()?;
        loop {
            let result = match &mut self.stage {
                Stage::Handshaked(stream) => stream.ssl_read(buf),
                _ => unreachable!("ensure_handshaked guarantees Handshaked"),
            };
            match result {
                Ok(n) => return Ok(n),
                Err(e) if e.code() == ErrorCode::ZERO_RETURN => return Ok(0),
                Err(e) if e.code() == ErrorCode::WANT_READ => self.pump(false, timeout_ms)?,
                Err(e) if e.code() == ErrorCode::WANT_WRITE => self.pump(true, timeout_ms)?,
                Err(e) => return Err(ssl_stack_error("TLS read failed", &e.to_string())),
            }
        }
    }

    /// Encrypts `buf` onto the wire, flushing the
    /// outbound BIO to the socket as needed.
    pub fn write(&mut self, buf: &[u8], timeout_ms: i64) -> Result<()> {
        self.ensure_handshaked()?;
        let mut written = 0;
        while written < buf.len() {
            let result = match &mut self.stage {
                Stage::Handshaked(stream) => stream.ssl_write(&buf[written..]),
                _ => unreachable!("ensure_handshaked guarantees Handshaked"),
            };
            match result {
                Ok(n) => written += n,
                Err(e) if e.code() == ErrorCode::WANT_READ => self.pump(false, timeout_ms)?,
                Err(e) if e.code() == ErrorCode::WANT_WRITE => self.pump(true, timeout_ms)?,
                Err(e) => return Err(ssl_stack_error("TLS write failed", &e.to_string())),
            }
        }
        self.pump(true, timeout_ms)
    }

    fn ensure_handshaked(&mut self) -> Result<()> {
        if self.is_handshaked() {
            Ok(())
        } else {
            Err(Error::new(Code::Emisuse, "TLS engine used before handshake completed"))
        }
    }

    /// Moves ciphertext between the real socket and the in-memory BIO pair.
    /// `flush_first` drains anything already produced before pulling more
    /// in, matching the "want write" branch of the handshake loop.
    fn pump(&mut self, flush_first: bool, timeout_ms: i64) -> Result<()> {
        let bio = match &mut self.stage {
            Stage::Handshaking(mid) => mid.get_mut(),
            Stage::Handshaked(stream) => stream.get_mut(),
            Stage::Idle(_) => return Ok(()),
        };

        if flush_first && !bio.outbound.is_empty() {
            let chunk: Vec<u8> = bio.outbound.drain(..).collect();
            self.socket.set_write_timeout(timeout_ms);
            self.socket.write(&chunk)?;
        }

        if !flush_first {
            let mut chunk = [0u8; 4096];
            self.socket.set_read_timeout(timeout_ms);
            let n = self.socket.read(&mut chunk)?;
            let bio = match &mut self.stage {
                Stage::Handshaking(mid) => mid.get_mut(),
                Stage::Handshaked(stream) => stream.get_mut(),
                Stage::Idle(_) => return Ok(()),
            };
            bio.inbound.extend(chunk[..n].iter().copied());
        }
        Ok(())
    }
}

/// `Ssl::new` needs a context; this placeholder is only ever swapped in for
/// one `mem::replace` heartbeat and never driven, so any valid context works.
fn placeholder_ssl() -> Ssl {
    let ctx = SslContext::builder(openssl::ssl::SslMethod::tls())
        .expect("failed to build a throwaway SSL context")
        .build();
    Ssl::new(&ctx).expect("failed to create a throwaway SSL session")
}

/// Drains the TLS library's error stack into one message and reports it
/// as `ESSL`.
fn ssl_stack_error(context: &str, detail: &str) -> Error {
    let stack = openssl::error::ErrorStack::get();
    let mut message = format!("{}: {}", context, detail);
    for err in stack.errors() {
        message.push_str("; ");
        message.push_str(&err.to_string());
    }
    Error::new(Code::Essl, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bio_pair_read_reports_would_block_when_empty() {
        let mut bio = BioPair::new();
        let mut buf = [0u8; 16];
        let err = bio.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn bio_pair_write_buffers_then_read_drains() {
        let mut bio = BioPair::new();
        bio.inbound.extend(b"hello".iter().copied());
        let mut buf = [0u8; 5];
        let n = bio.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert!(bio.inbound.is_empty());
    }
}
