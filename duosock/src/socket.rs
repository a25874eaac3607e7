//! OS socket setup through socket2
//!
//! Sockets are created non-blocking with socket2, optionally bound, and
//! then handed to tokio. TCP connects are issued here too: `connect()`
//! returns `EINPROGRESS`, write readiness marks the end of the handshake,
//! and `SO_ERROR` tells success from failure.

use std::io;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};

use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use tokio::net::{TcpStream, UdpSocket};

/// Address family of one of the two sockets an engine may own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }

    pub fn other(self) -> Self {
        match self {
            Family::V4 => Family::V6,
            Family::V6 => Family::V4,
        }
    }

    fn domain(self) -> Domain {
        match self {
            Family::V4 => Domain::IPV4,
            Family::V6 => Domain::IPV6,
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Family::V4 => write!(f, "IPv4"),
            Family::V6 => write!(f, "IPv6"),
        }
    }
}

/// Create a non-blocking TCP socket, bound to `local` if given
pub(crate) fn tcp_socket(family: Family, local: Option<SocketAddr>) -> io::Result<Socket> {
    let socket = Socket::new(family.domain(), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    if family == Family::V6 {
        socket.set_only_v6(true)?;
    }
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    socket.set_nosigpipe(true)?;

    if let Some(local) = local {
        socket.set_reuse_address(true)?;
        socket.bind(&SockAddr::from(local))?;
    }
    Ok(socket)
}

fn connect_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EINPROGRESS)
}

/// Connect a prepared socket without blocking the runtime
pub(crate) async fn connect_tcp(socket: Socket, addr: SocketAddr) -> io::Result<TcpStream> {
    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => {}
        Err(e) if connect_in_progress(&e) => {}
        Err(e) => return Err(e),
    }

    let stream = TcpStream::from_std(std::net::TcpStream::from(socket))?;
    stream.writable().await?;

    if let Some(e) = stream.take_error()? {
        return Err(e);
    }
    // some platforms flag a refused connect as writable before SO_ERROR is set
    stream.peer_addr()?;
    Ok(stream)
}

/// Wrap an already-connected std stream
pub(crate) fn adopt_tcp(stream: std::net::TcpStream) -> io::Result<TcpStream> {
    stream.set_nonblocking(true)?;
    TcpStream::from_std(stream)
}

/// Create a non-blocking, unbound UDP socket registered with tokio
pub(crate) fn udp_socket(family: Family, reuse_port: bool) -> io::Result<UdpSocket> {
    let socket = Socket::new(family.domain(), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    if family == Family::V6 {
        socket.set_only_v6(true)?;
    }
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    socket.set_nosigpipe(true)?;

    if reuse_port {
        set_reuse_port(&socket, true)?;
    }

    UdpSocket::from_std(std::net::UdpSocket::from(socket))
}

/// Bind an existing UDP socket
pub(crate) fn bind_udp(socket: &UdpSocket, addr: SocketAddr) -> io::Result<()> {
    SockRef::from(socket).bind(&SockAddr::from(addr))
}

/// Give a UDP socket a default peer
pub(crate) fn connect_udp(socket: &UdpSocket, addr: SocketAddr) -> io::Result<()> {
    SockRef::from(socket).connect(&SockAddr::from(addr))
}

/// Toggle address/port reuse; only meaningful before bind
pub(crate) fn set_reuse_port<'s, S>(socket: S, enabled: bool) -> io::Result<()>
where
    S: Into<SockRef<'s>>,
{
    let sock = socket.into();
    sock.set_reuse_address(enabled)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    sock.set_reuse_port(enabled)?;
    Ok(())
}

/// Join or leave an IPv4 group on the interface owning `interface`
pub(crate) fn multicast_v4(
    socket: &UdpSocket,
    group: SocketAddrV4,
    interface: Option<SocketAddrV4>,
    join: bool,
) -> io::Result<()> {
    let iface = interface
        .map(|a| *a.ip())
        .unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
    if join {
        socket.join_multicast_v4(*group.ip(), iface)
    } else {
        socket.leave_multicast_v4(*group.ip(), iface)
    }
}

/// Join or leave an IPv6 group on interface `index` (0 lets the OS pick)
pub(crate) fn multicast_v6(
    socket: &UdpSocket,
    group: SocketAddrV6,
    index: u32,
    join: bool,
) -> io::Result<()> {
    if join {
        socket.join_multicast_v6(group.ip(), index)
    } else {
        socket.leave_multicast_v6(group.ip(), index)
    }
}

/// Non-blocking I/O adaptor over a tokio stream for sans-io TLS
///
/// `try_read`/`try_write` clear readiness on `WouldBlock`, so the engine
/// loop parks on `readable()`/`writable()` until the kernel has more.
pub(crate) struct StreamIo<'a>(pub &'a TcpStream);

impl io::Read for StreamIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl io::Write for StreamIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
