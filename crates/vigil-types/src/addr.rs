//! Resolved network addresses.

use std::fmt::{self, Display};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use thiserror::Error;

/// Errors produced while resolving an address.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    /// Port is outside the valid 1..=65535 range.
    #[error("invalid port: {0}")]
    InvalidPort(u32),

    /// Hostname lookup failed.
    #[error("unresolvable host: {0}")]
    Unresolvable(String),
}

/// A resolved instance address: ip plus a non-zero port.
///
/// Replica and peer names are synthesised from the address, so the display
/// form is canonical: `ip:port`, with IPv6 hosts bracketed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub ip: IpAddr,
    pub port: u16,
}

impl Address {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Resolves `host:port` into a concrete address.
    ///
    /// The first resolved ip is used when the name maps to several.
    pub fn resolve(host: &str, port: u32) -> Result<Self, AddressError> {
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or(AddressError::InvalidPort(port))?;

        // Fast path: a literal ip needs no lookup.
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Self { ip, port });
        }

        let mut addrs = (host, port)
            .to_socket_addrs()
            .map_err(|_| AddressError::Unresolvable(host.to_string()))?;
        match addrs.next() {
            Some(SocketAddr::V4(a)) => Ok(Self {
                ip: IpAddr::V4(*a.ip()),
                port,
            }),
            Some(SocketAddr::V6(a)) => Ok(Self {
                ip: IpAddr::V6(*a.ip()),
                port,
            }),
            None => Err(AddressError::Unresolvable(host.to_string())),
        }
    }

    /// The canonical `ip:port` name for this address.
    ///
    /// Same as the `Display` form; used as the map key for replicas and
    /// peers.
    pub fn instance_name(&self) -> String {
        self.to_string()
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

impl From<Address> for SocketAddr {
    fn from(addr: Address) -> Self {
        SocketAddr::new(addr.ip, addr.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_ipv4_resolves_without_lookup() {
        let addr = Address::resolve("10.0.0.1", 6379).unwrap();
        assert_eq!(addr.to_string(), "10.0.0.1:6379");
    }

    #[test]
    fn ipv6_name_is_bracketed() {
        let addr = Address::resolve("::1", 6379).unwrap();
        assert_eq!(addr.instance_name(), "[::1]:6379");
    }

    #[test]
    fn port_zero_is_invalid() {
        assert_eq!(
            Address::resolve("10.0.0.1", 0),
            Err(AddressError::InvalidPort(0))
        );
    }

    #[test]
    fn port_above_u16_is_invalid() {
        assert_eq!(
            Address::resolve("10.0.0.1", 70000),
            Err(AddressError::InvalidPort(70000))
        );
    }

    #[test]
    fn garbage_host_is_unresolvable() {
        let err = Address::resolve("no.such.host.invalid.", 6379).unwrap_err();
        assert!(matches!(err, AddressError::Unresolvable(_)));
    }
}
