//! Socket address algebra: the IP world plus AF_UNIX paths and the
//! no-address TTY/pipe cases, unified behind one enum rather than
//! `std::net`'s IP-only `SocketAddr`.

use std::fmt;
use std::net::SocketAddr as StdSocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ip(StdSocketAddr),
    Unix(PathBuf),
    /// TTY / already-adopted fd with no addressable endpoint.
    None,
}

impl Address {
    pub fn as_ip(&self) -> Option<&StdSocketAddr> {
        match self {
            Address::Ip(addr) => Some(addr),
            _ => None,
        }
    }

    pub fn as_unix(&self) -> Option<&PathBuf> {
        match self {
            Address::Unix(path) => Some(path),
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Unix(path) => write!(f, "unix:{}", path.display()),
            Address::None => write!(f, "<no address>"),
        }
    }
}

impl From<StdSocketAddr> for Address {
    fn from(addr: StdSocketAddr) -> Self {
        Address::Ip(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_displays_like_std() {
        let addr: Address = "127.0.0.1:8080".parse::<StdSocketAddr>().unwrap().into();
        assert_eq!(addr.to_string(), "127.0.0.1:8080");
    }
}
