//! Interface descriptors
//!
//! An interface descriptor names the local side of a socket. It can be an
//! interface name (`"en0"`, `"lo"`), an IP literal owned by this host,
//! `"localhost"`/`"loopback"`, or any of those followed by `:port`
//! (`"[::1]:port"` for IPv6 literals). All platform enumeration lives in
//! this module.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::{Error, Result};
use crate::lookup::{is_loopback_name, numeric_host};

/// Local addresses selected by an interface descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceAddresses {
    /// IPv4 address to bind, if the interface has one
    pub v4: Option<SocketAddrV4>,
    /// IPv6 address to bind, if the interface has one
    pub v6: Option<SocketAddrV6>,
    /// Interface index, when known (IPv6 multicast needs it)
    pub index: Option<u32>,
}

impl InterfaceAddresses {
    /// Check if neither family is available
    pub fn is_empty(&self) -> bool {
        self.v4.is_none() && self.v6.is_none()
    }

    /// The port every address carries
    pub fn port(&self) -> Option<u16> {
        self.v4
            .map(|a| a.port())
            .or_else(|| self.v6.map(|a| a.port()))
    }
}

/// A local network interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    /// Interface name
    pub name: String,
    /// Interface index (0 when unknown)
    pub index: u32,
    /// Whether this is a loopback interface
    pub loopback: bool,
    /// Addresses assigned to the interface
    pub addresses: Vec<IpAddr>,
}

/// Split an optional trailing `:port` off a descriptor
///
/// Bare IPv6 literals contain colons themselves, so only bracketed ones may
/// carry a port.
pub fn split_descriptor(descriptor: &str) -> Result<(&str, Option<u16>)> {
    if let Some(rest) = descriptor.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| Error::InvalidAddress(descriptor.to_string()))?;
        return match tail.strip_prefix(':') {
            Some(port) => Ok((host, Some(parse_port(descriptor, port)?))),
            None if tail.is_empty() => Ok((host, None)),
            None => Err(Error::InvalidAddress(descriptor.to_string())),
        };
    }

    match descriptor.matches(':').count() {
        1 => {
            let (host, port) = descriptor
                .split_once(':')
                .ok_or_else(|| Error::InvalidAddress(descriptor.to_string()))?;
            Ok((host, Some(parse_port(descriptor, port)?)))
        }
        _ => Ok((descriptor, None)),
    }
}

fn parse_port(descriptor: &str, port: &str) -> Result<u16> {
    port.parse::<u16>()
        .map_err(|_| Error::InvalidAddress(format!("bad port in {}", descriptor)))
}

/// Resolve an interface descriptor into bindable addresses
///
/// `port` applies unless the descriptor carries its own.
pub fn resolve_interface(descriptor: &str, port: u16) -> Result<InterfaceAddresses> {
    let (host, descriptor_port) = split_descriptor(descriptor)?;
    let port = descriptor_port.unwrap_or(port);

    if host.is_empty() {
        return Err(Error::UnknownInterface(descriptor.to_string()));
    }

    if is_loopback_name(host) {
        return Ok(InterfaceAddresses {
            v4: Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)),
            v6: Some(SocketAddrV6::new(Ipv6Addr::LOCALHOST, port, 0, 0)),
            index: loopback_index(),
        });
    }

    if let Some(addr) = numeric_host(host, port) {
        return resolve_literal(descriptor, addr);
    }

    resolve_named(host, port)
}

fn resolve_literal(descriptor: &str, addr: SocketAddr) -> Result<InterfaceAddresses> {
    if addr.ip().is_unspecified() {
        return Ok(match addr {
            SocketAddr::V4(a) => InterfaceAddresses {
                v4: Some(a),
                ..Default::default()
            },
            SocketAddr::V6(a) => InterfaceAddresses {
                v6: Some(a),
                ..Default::default()
            },
        });
    }

    let owner = interfaces()
        .unwrap_or_default()
        .into_iter()
        .find(|iface| iface.addresses.contains(&addr.ip()));

    // Without enumeration support every literal is taken at face value
    if owner.is_none() && enumeration_supported() {
        return Err(Error::UnknownInterface(descriptor.to_string()));
    }

    let index = owner.map(|iface| iface.index).filter(|i| *i != 0);
    Ok(match addr {
        SocketAddr::V4(a) => InterfaceAddresses {
            v4: Some(a),
            v6: None,
            index,
        },
        SocketAddr::V6(a) => {
            let scope = if is_link_local(a.ip()) {
                index.unwrap_or(0)
            } else {
                a.scope_id()
            };
            InterfaceAddresses {
                v4: None,
                v6: Some(SocketAddrV6::new(*a.ip(), a.port(), 0, scope)),
                index,
            }
        }
    })
}

fn resolve_named(name: &str, port: u16) -> Result<InterfaceAddresses> {
    let iface = interfaces()?
        .into_iter()
        .find(|iface| iface.name == name)
        .ok_or_else(|| Error::UnknownInterface(name.to_string()))?;

    let v4 = iface.addresses.iter().find_map(|ip| match ip {
        IpAddr::V4(v4) => Some(SocketAddrV4::new(*v4, port)),
        IpAddr::V6(_) => None,
    });
    let v6 = iface.addresses.iter().find_map(|ip| match ip {
        IpAddr::V6(v6) => {
            let scope = if is_link_local(v6) { iface.index } else { 0 };
            Some(SocketAddrV6::new(*v6, port, 0, scope))
        }
        IpAddr::V4(_) => None,
    });

    let resolved = InterfaceAddresses {
        v4,
        v6,
        index: Some(iface.index).filter(|i| *i != 0),
    };
    if resolved.is_empty() {
        return Err(Error::UnknownInterface(name.to_string()));
    }
    Ok(resolved)
}

fn is_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

fn loopback_index() -> Option<u32> {
    interfaces()
        .ok()?
        .into_iter()
        .find(|iface| iface.loopback)
        .map(|iface| iface.index)
        .filter(|i| *i != 0)
}

/// Enumerate local interfaces with their addresses
#[cfg(unix)]
pub fn interfaces() -> Result<Vec<InterfaceInfo>> {
    use nix::ifaddrs::getifaddrs;
    use nix::net::if_::{if_nametoindex, InterfaceFlags};

    let mut found: Vec<InterfaceInfo> = Vec::new();

    for ifaddr in getifaddrs().map_err(std::io::Error::from)? {
        let ip = ifaddr.address.as_ref().and_then(|storage| {
            if let Some(sin) = storage.as_sockaddr_in() {
                Some(IpAddr::V4(*SocketAddrV4::from(*sin).ip()))
            } else {
                storage
                    .as_sockaddr_in6()
                    .map(|sin6| IpAddr::V6(*SocketAddrV6::from(*sin6).ip()))
            }
        });

        let pos = match found.iter().position(|i| i.name == ifaddr.interface_name) {
            Some(pos) => pos,
            None => {
                let index = if_nametoindex(ifaddr.interface_name.as_str()).unwrap_or(0);
                found.push(InterfaceInfo {
                    name: ifaddr.interface_name.clone(),
                    index,
                    loopback: ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK),
                    addresses: Vec::new(),
                });
                found.len() - 1
            }
        };

        if let Some(ip) = ip {
            if !found[pos].addresses.contains(&ip) {
                found[pos].addresses.push(ip);
            }
        }
    }

    Ok(found)
}

/// Enumerate local interfaces with their addresses
#[cfg(not(unix))]
pub fn interfaces() -> Result<Vec<InterfaceInfo>> {
    Ok(Vec::new())
}

fn enumeration_supported() -> bool {
    cfg!(unix)
}
