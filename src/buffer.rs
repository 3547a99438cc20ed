//! A small `Vec<u8>` newtype enforcing the truncate/append discipline the
//! TLS pump and HTTP scratch buffers both rely on: appending `b` after
//! truncating to length `l` always yields a buffer of length `l + b.len()`,
//! with the first `l` bytes unchanged.

#[derive(Debug, Clone, Default)]
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer { data: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Buffer {
        Buffer { data: Vec::with_capacity(cap) }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Shrinks to `len`, a no-op if already shorter.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Appends `extra` to the end, regardless of any prior truncation.
    pub fn append(&mut self, extra: &[u8]) {
        self.data.extend_from_slice(extra);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn drain_front(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.data.len());
        self.data.drain(..n).collect()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Buffer {
        Buffer { data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_then_append_preserves_prefix() {
        let mut buf = Buffer::from(b"hello world".to_vec());
        buf.truncate(5);
        buf.append(b"!!!");
        assert_eq!(buf.as_slice(), b"hello!!!");
    }

    #[test]
    fn drain_front_removes_consumed_prefix() {
        let mut buf = Buffer::from(b"abcdef".to_vec());
        let drained = buf.drain_front(3);
        assert_eq!(drained, b"abc");
        assert_eq!(buf.as_slice(), b"def");
    }
}
