use crate::error::Error;

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

const INTERNAL_PREFIX: &str = "internal:";

/// A connection endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// An IP socket address.
    Ip(SocketAddr),
    /// An in-process listener reached over a userspace pipe.
    Internal(String),
}

impl Address {
    pub fn ip(&self) -> Option<SocketAddr> {
        match self {
            Address::Ip(addr) => Some(*addr),
            Address::Internal(_) => None,
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Address::Internal(_))
    }

    /// The unbound address of the same family, used as the local address of
    /// a client connection until it is bound or connected.
    pub(crate) fn unspecified_local(&self) -> Address {
        match self {
            Address::Ip(SocketAddr::V4(_)) => {
                Address::Ip(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            }
            Address::Ip(SocketAddr::V6(_)) => {
                Address::Ip(SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)))
            }
            Address::Internal(name) => Address::Internal(name.clone()),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{addr}"),
            Address::Internal(name) => write!(f, "{INTERNAL_PREFIX}{name}"),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Ip(addr)
    }
}

impl FromStr for Address {
    type Err = Error;

    /// Parses `ip:port`, `[ipv6]:port` or `internal:<name>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(name) = s.strip_prefix(INTERNAL_PREFIX) {
            if name.is_empty() {
                return Err(Error::InvalidAddress(s.to_string()));
            }
            return Ok(Address::Internal(name.to_string()));
        }
        s.parse::<SocketAddr>()
            .map(Address::Ip)
            .map_err(|_| Error::InvalidAddress(s.to_string()))
    }
}
