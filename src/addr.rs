//! Tagged IPv4/IPv6 endpoint addresses.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// An address family-tagged endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Addr {
    /// IPv4 endpoint.
    V4(SocketAddrV4),
    /// IPv6 endpoint.
    V6(SocketAddrV6),
}

impl Addr {
    /// Parse a numeric IPv4/IPv6 string plus a port into a tagged
    /// address. Does not perform DNS resolution.
    pub fn parse(host: &str, port: u16) -> Result<Self, std::net::AddrParseError> {
        if let Ok(v4) = host.parse::<Ipv4Addr>() {
            return Ok(Addr::V4(SocketAddrV4::new(v4, port)));
        }
        let v6 = host.parse::<Ipv6Addr>()?;
        Ok(Addr::V6(SocketAddrV6::new(v6, port, 0, 0)))
    }

    /// The port, stored and returned in host byte order.
    pub fn port(&self) -> u16 {
        match self {
            Addr::V4(a) => a.port(),
            Addr::V6(a) => a.port(),
        }
    }
}

impl From<SocketAddr> for Addr {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(a) => Addr::V4(a),
            SocketAddr::V6(a) => Addr::V6(a),
        }
    }
}

impl From<Addr> for SocketAddr {
    fn from(addr: Addr) -> Self {
        match addr {
            Addr::V4(a) => SocketAddr::V4(a),
            Addr::V6(a) => SocketAddr::V6(a),
        }
    }
}
