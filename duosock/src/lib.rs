//! Async dual-stack TCP and UDP socket engines
//!
//! Each socket is an actor task that owns the OS sockets, the packet queues
//! and the timers. Handles (`TcpSocket`, `UdpSocket`) are cheap to clone and
//! talk to the actor over a channel; results come back through an
//! owner-supplied delegate running on a `DelegateQueue`.
//!
//! # TCP
//!
//! ```ignore
//! use duosock::{TcpSocket, LoggingTcpDelegate};
//! use std::time::Duration;
//!
//! let sock = TcpSocket::builder().delegate(LoggingTcpDelegate).build()?;
//! sock.connect("example.com", 443, Some(Duration::from_secs(5))).await?;
//! sock.start_tls(duosock::TlsSettings::client());
//! sock.write_data(&b"GET / HTTP/1.0\r\n\r\n"[..], None, 1)?;
//! sock.read_data_to_terminator(b"\r\n\r\n", None, None, 2)?;
//! ```
//!
//! # UDP
//!
//! ```ignore
//! use duosock::{UdpSocket, LoggingUdpDelegate};
//!
//! let sock = UdpSocket::builder().delegate(LoggingUdpDelegate).build()?;
//! sock.bind_to_port(5000, None).await?;
//! sock.join_multicast_group("239.255.0.1", None).await?;
//! sock.begin_receiving().await?;
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod flags;
pub mod prebuffer;
pub mod socket;
pub mod state;
pub mod tcp;
pub mod timer;
pub mod udp;

pub use config::{Config, TcpConfig, TlsConfig, UdpConfig};
pub use error::{Error, Result};
pub use event::{
    DelegateQueue, FilterContext, LoggingTcpDelegate, LoggingUdpDelegate, TcpSocketDelegate,
    TrustCompletion, UdpSocketDelegate,
};
pub use flags::{Options, SocketFlags};
pub use prebuffer::PreBuffer;
pub use socket::Family;
pub use state::{SocketId, StateIndex};
pub use tcp::{TcpInfo, TcpSocket, TcpSocketBuilder};
pub use timer::Timer;
pub use udp::{
    FilterMode, FilterVerdict, ReceiveFilter, SendFilter, UdpInfo, UdpSocket, UdpSocketBuilder,
};

pub use duo_tls::{CertificateDer, TlsSettings, TlsVersion};

/// Opaque value the owner attaches to a read, write or send
pub type Tag = i64;
