//! Host name lookup
//!
//! Names go through the system resolver (getaddrinfo with an unspecified
//! family) on tokio's blocking pool, so the caller's task never blocks.
//! Both families come back from a single query and are split here; the
//! engines race them at connect time.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::{Error, Result};

/// Addresses produced by a lookup, split by family in resolver order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedAddresses {
    /// IPv4 results
    pub v4: Vec<SocketAddrV4>,
    /// IPv6 results
    pub v6: Vec<SocketAddrV6>,
}

impl ResolvedAddresses {
    /// Build from a mixed list, keeping order within each family
    pub fn from_addrs<I: IntoIterator<Item = SocketAddr>>(addrs: I) -> Self {
        let mut resolved = Self::default();
        for addr in addrs {
            resolved.push(addr);
        }
        resolved
    }

    fn push(&mut self, addr: SocketAddr) {
        match addr {
            SocketAddr::V4(a) => {
                if !self.v4.contains(&a) {
                    self.v4.push(a);
                }
            }
            SocketAddr::V6(a) => {
                if !self.v6.contains(&a) {
                    self.v6.push(a);
                }
            }
        }
    }

    /// First IPv4 result
    pub fn first_v4(&self) -> Option<SocketAddrV4> {
        self.v4.first().copied()
    }

    /// First IPv6 result
    pub fn first_v6(&self) -> Option<SocketAddrV6> {
        self.v6.first().copied()
    }

    /// Check if nothing was resolved
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    /// All addresses, IPv4 first
    pub fn all(&self) -> Vec<SocketAddr> {
        self.v4
            .iter()
            .map(|a| SocketAddr::V4(*a))
            .chain(self.v6.iter().map(|a| SocketAddr::V6(*a)))
            .collect()
    }
}

/// Check for the names that always mean the loopback interface
pub(crate) fn is_loopback_name(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost") || host.eq_ignore_ascii_case("loopback")
}

/// Loopback addresses for both families
pub fn loopback_addresses(port: u16) -> ResolvedAddresses {
    ResolvedAddresses {
        v4: vec![SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)],
        v6: vec![SocketAddrV6::new(Ipv6Addr::LOCALHOST, port, 0, 0)],
    }
}

/// Wildcard addresses for both families
pub fn any_addresses(port: u16) -> (SocketAddrV4, SocketAddrV6) {
    (
        SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port),
        SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0),
    )
}

/// Parse a numeric host without touching the resolver
///
/// Accepts bare literals and bracketed IPv6 literals. Returns `None` for
/// anything that would need a lookup.
pub fn numeric_host(host: &str, port: u16) -> Option<SocketAddr> {
    let trimmed = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    trimmed
        .parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, port))
}

/// Resolve a host name or literal into addresses of both families
pub async fn lookup_host(host: &str, port: u16) -> Result<ResolvedAddresses> {
    if host.is_empty() {
        return Err(Error::InvalidAddress("empty host".into()));
    }

    if is_loopback_name(host) {
        return Ok(loopback_addresses(port));
    }

    if let Some(addr) = numeric_host(host, port) {
        return Ok(ResolvedAddresses::from_addrs([addr]));
    }

    log::debug!("Resolving {}:{}", host, port);

    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::Lookup {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

    let resolved = ResolvedAddresses::from_addrs(addrs);
    if resolved.is_empty() {
        return Err(Error::NoAddresses(host.to_string()));
    }

    log::debug!(
        "Resolved {}: {} IPv4, {} IPv6",
        host,
        resolved.v4.len(),
        resolved.v6.len()
    );

    Ok(resolved)
}
