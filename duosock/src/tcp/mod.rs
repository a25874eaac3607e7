//! TCP socket engine
//!
//! `TcpSocket` is a handle to an engine task. Connects are raced across
//! address families, reads and writes are queued and completed in order,
//! and TLS can be started at any point in the stream.

mod engine;
pub(crate) mod packet;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use duo_tls::{TlsSettings, TlsVersion};
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::TcpConfig;
use crate::error::{Error, Result};
use crate::event::{DelegateQueue, TcpSocketDelegate};
use crate::flags::{Options, SocketFlags};
use crate::state::SocketId;
use crate::Tag;

use engine::TcpEngine;
use packet::ReadKind;

/// Delay before the alternate family joins the connect race
pub const DEFAULT_ALTERNATE_ADDRESS_DELAY: Duration = Duration::from_millis(300);

/// Bytes requested from the kernel per socket read
pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;

/// Snapshot of a TCP socket's state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TcpInfo {
    pub flags: SocketFlags,
    pub options: Options,
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
    /// Negotiated TLS version, once secure
    pub tls_version: Option<TlsVersion>,
    /// Negotiated ALPN protocol, once secure
    pub alpn: Option<Vec<u8>>,
    pub cipher_suite: Option<String>,
    /// Queued reads, including the one in flight
    pub pending_reads: usize,
    /// Queued writes, including the one in flight
    pub pending_writes: usize,
}

impl TcpInfo {
    pub fn is_connected(&self) -> bool {
        self.flags.contains(SocketFlags::CONNECTED) && !self.flags.contains(SocketFlags::CLOSED)
    }

    /// Not started yet, or already torn down
    pub fn is_disconnected(&self) -> bool {
        !self.flags.contains(SocketFlags::STARTED) || self.flags.contains(SocketFlags::CLOSED)
    }

    pub fn is_secure(&self) -> bool {
        self.flags.contains(SocketFlags::SECURE) && !self.flags.contains(SocketFlags::CLOSED)
    }

    pub fn is_closed(&self) -> bool {
        self.flags.contains(SocketFlags::CLOSED)
    }
}

pub(crate) enum ConnectTarget {
    Host {
        host: String,
        port: u16,
        interface: Option<String>,
    },
    Address(SocketAddr),
}

pub(crate) enum Setting {
    Ipv4Enabled(bool),
    Ipv6Enabled(bool),
    PreferIpv4,
    PreferIpv6,
    AllowHalfDuplex(bool),
    AlternateAddressDelay(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DisconnectMode {
    Now,
    AfterReads,
    AfterWrites,
    AfterReadsAndWrites,
}

pub(crate) enum Command {
    SetDelegate(Arc<dyn TcpSocketDelegate>, Option<DelegateQueue>),
    Configure(Setting),
    Connect {
        target: ConnectTarget,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<()>>,
    },
    Read {
        kind: ReadKind,
        timeout: Option<Duration>,
        tag: Tag,
    },
    Write {
        data: Vec<u8>,
        timeout: Option<Duration>,
        tag: Tag,
    },
    StartTls(TlsSettings),
    Disconnect(DisconnectMode),
}

pub(crate) struct Shared {
    id: SocketId,
    commands: mpsc::UnboundedSender<Command>,
    info: watch::Receiver<TcpInfo>,
}

/// Handle to a TCP socket engine
///
/// Clones share the engine. Dropping the last handle closes the socket
/// without notifying the delegate.
#[derive(Clone)]
pub struct TcpSocket {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info = self.info();
        f.debug_struct("TcpSocket")
            .field("id", &self.shared.id)
            .field("flags", &info.flags)
            .field("peer", &info.peer_addr)
            .finish()
    }
}

impl TcpSocket {
    /// Create an idle socket with default settings and no delegate
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new() -> Self {
        TcpEngine::spawn(TcpSocketBuilder::default(), None)
    }

    pub fn builder() -> TcpSocketBuilder {
        TcpSocketBuilder::default()
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> SocketId {
        self.shared.id
    }

    fn send(&self, command: Command) -> bool {
        if self.shared.commands.send(command).is_err() {
            log::debug!("{} engine has stopped, command dropped", self.shared.id);
            return false;
        }
        true
    }

    /// Set the callback sink and, optionally, the queue it runs on
    pub fn set_delegate<D: TcpSocketDelegate>(&self, delegate: D, queue: Option<DelegateQueue>) {
        self.set_shared_delegate(Arc::new(delegate), queue);
    }

    pub fn set_shared_delegate(
        &self,
        delegate: Arc<dyn TcpSocketDelegate>,
        queue: Option<DelegateQueue>,
    ) {
        self.send(Command::SetDelegate(delegate, queue));
    }

    // ========================================================================
    // Connecting
    // ========================================================================

    /// Connect to a host name or literal
    ///
    /// Returns once the request is accepted; the outcome arrives through
    /// `did_connect` or `did_disconnect`.
    pub async fn connect(&self, host: &str, port: u16, timeout: Option<Duration>) -> Result<()> {
        self.request_connect(
            ConnectTarget::Host {
                host: host.to_string(),
                port,
                interface: None,
            },
            timeout,
        )
        .await
    }

    /// Connect from a specific local interface
    ///
    /// `interface` is an interface name, a local address or "localhost",
    /// optionally with a `:port` suffix choosing the local port.
    pub async fn connect_via_interface(
        &self,
        host: &str,
        port: u16,
        interface: &str,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.request_connect(
            ConnectTarget::Host {
                host: host.to_string(),
                port,
                interface: Some(interface.to_string()),
            },
            timeout,
        )
        .await
    }

    /// Connect to a resolved address, skipping the lookup and the race
    pub async fn connect_to_address(
        &self,
        addr: SocketAddr,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.request_connect(ConnectTarget::Address(addr), timeout)
            .await
    }

    async fn request_connect(&self, target: ConnectTarget, timeout: Option<Duration>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if !self.send(Command::Connect {
            target,
            timeout,
            reply,
        }) {
            return Err(Error::BadConfig("socket is closed".into()));
        }
        rx.await
            .unwrap_or_else(|_| Err(Error::BadConfig("socket is closed".into())))
    }

    // ========================================================================
    // Reading and writing
    // ========================================================================

    /// Read whatever bytes are available
    pub fn read_data(&self, timeout: Option<Duration>, tag: Tag) -> Result<()> {
        self.enqueue_read(ReadKind::Available { max: None }, timeout, tag)
    }

    /// Read whatever bytes are available, at most `max_length`
    pub fn read_data_with_max_length(
        &self,
        max_length: usize,
        timeout: Option<Duration>,
        tag: Tag,
    ) -> Result<()> {
        self.enqueue_read(
            ReadKind::Available {
                max: Some(max_length),
            },
            timeout,
            tag,
        )
    }

    /// Read exactly `length` bytes
    pub fn read_data_to_length(
        &self,
        length: usize,
        timeout: Option<Duration>,
        tag: Tag,
    ) -> Result<()> {
        self.enqueue_read(ReadKind::Length(length), timeout, tag)
    }

    /// Read up to and including `terminator`
    ///
    /// With `max_length`, the socket closes with `ReadMaxedOut` once that
    /// many bytes arrive without the terminator.
    pub fn read_data_to_terminator(
        &self,
        terminator: &[u8],
        max_length: Option<usize>,
        timeout: Option<Duration>,
        tag: Tag,
    ) -> Result<()> {
        self.enqueue_read(
            ReadKind::Terminator {
                term: terminator.to_vec(),
                max: max_length,
            },
            timeout,
            tag,
        )
    }

    fn enqueue_read(&self, kind: ReadKind, timeout: Option<Duration>, tag: Tag) -> Result<()> {
        kind.validate()?;
        self.send(Command::Read { kind, timeout, tag });
        Ok(())
    }

    /// Queue bytes for writing
    pub fn write_data(
        &self,
        data: impl Into<Vec<u8>>,
        timeout: Option<Duration>,
        tag: Tag,
    ) -> Result<()> {
        let data = data.into();
        if data.is_empty() {
            return Err(Error::BadParam("write data must not be empty".into()));
        }
        self.send(Command::Write { data, timeout, tag });
        Ok(())
    }

    /// Start TLS once every read and write queued so far completes
    pub fn start_tls(&self, settings: TlsSettings) {
        self.send(Command::StartTls(settings));
    }

    // ========================================================================
    // Disconnecting
    // ========================================================================

    /// Close now, dropping queued work
    pub fn disconnect(&self) {
        self.send(Command::Disconnect(DisconnectMode::Now));
    }

    /// Refuse new I/O and close once queued reads finish
    pub fn disconnect_after_reading(&self) {
        self.send(Command::Disconnect(DisconnectMode::AfterReads));
    }

    /// Refuse new I/O and close once queued writes finish
    pub fn disconnect_after_writing(&self) {
        self.send(Command::Disconnect(DisconnectMode::AfterWrites));
    }

    pub fn disconnect_after_reading_and_writing(&self) {
        self.send(Command::Disconnect(DisconnectMode::AfterReadsAndWrites));
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    pub fn set_ipv4_enabled(&self, enabled: bool) {
        self.send(Command::Configure(Setting::Ipv4Enabled(enabled)));
    }

    pub fn set_ipv6_enabled(&self, enabled: bool) {
        self.send(Command::Configure(Setting::Ipv6Enabled(enabled)));
    }

    pub fn set_prefer_ipv4(&self) {
        self.send(Command::Configure(Setting::PreferIpv4));
    }

    pub fn set_prefer_ipv6(&self) {
        self.send(Command::Configure(Setting::PreferIpv6));
    }

    /// Keep writing after the peer finishes sending
    pub fn set_allow_half_duplex(&self, allowed: bool) {
        self.send(Command::Configure(Setting::AllowHalfDuplex(allowed)));
    }

    pub fn set_alternate_address_delay(&self, delay: Duration) {
        self.send(Command::Configure(Setting::AlternateAddressDelay(delay)));
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Latest published state
    pub fn info(&self) -> TcpInfo {
        self.shared.info.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.info.borrow().is_connected()
    }

    pub fn is_disconnected(&self) -> bool {
        self.shared.info.borrow().is_disconnected()
    }

    pub fn is_secure(&self) -> bool {
        self.shared.info.borrow().is_secure()
    }

    pub fn connected_address(&self) -> Option<SocketAddr> {
        self.shared.info.borrow().peer_addr
    }

    pub fn connected_host(&self) -> Option<String> {
        self.connected_address().map(|a| a.ip().to_string())
    }

    pub fn connected_port(&self) -> Option<u16> {
        self.connected_address().map(|a| a.port())
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.shared.info.borrow().local_addr
    }

    pub fn local_host(&self) -> Option<String> {
        self.local_address().map(|a| a.ip().to_string())
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_address().map(|a| a.port())
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self.connected_address().map(|a| a.ip()), Some(IpAddr::V4(_)))
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.connected_address().map(|a| a.ip()), Some(IpAddr::V6(_)))
    }

    /// Wait until the socket is torn down
    pub async fn closed(&self) {
        let mut info = self.shared.info.clone();
        let _ = info.wait_for(|i| i.is_closed()).await;
    }
}

impl Default for TcpSocket {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `TcpSocket`
pub struct TcpSocketBuilder {
    pub(crate) delegate: Option<Arc<dyn TcpSocketDelegate>>,
    pub(crate) queue: Option<DelegateQueue>,
    pub(crate) options: Options,
    pub(crate) alternate_delay: Duration,
    pub(crate) read_chunk_size: usize,
    stream: Option<std::net::TcpStream>,
}

impl Default for TcpSocketBuilder {
    fn default() -> Self {
        Self {
            delegate: None,
            queue: None,
            options: Options::default(),
            alternate_delay: DEFAULT_ALTERNATE_ADDRESS_DELAY,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            stream: None,
        }
    }
}

impl TcpSocketBuilder {
    pub fn delegate<D: TcpSocketDelegate>(mut self, delegate: D) -> Self {
        self.delegate = Some(Arc::new(delegate));
        self
    }

    pub fn shared_delegate(mut self, delegate: Arc<dyn TcpSocketDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Queue for delegate callbacks; each socket gets its own by default
    pub fn delegate_queue(mut self, queue: DelegateQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn ipv4_enabled(mut self, enabled: bool) -> Self {
        self.options.set_ipv4_enabled(enabled);
        self
    }

    pub fn ipv6_enabled(mut self, enabled: bool) -> Self {
        self.options.set_ipv6_enabled(enabled);
        self
    }

    pub fn prefer_ipv4(mut self) -> Self {
        self.options.set_prefer_ipv4();
        self
    }

    pub fn prefer_ipv6(mut self) -> Self {
        self.options.set_prefer_ipv6();
        self
    }

    pub fn allow_half_duplex(mut self, allowed: bool) -> Self {
        self.options.set(Options::ALLOW_HALF_DUPLEX, allowed);
        self
    }

    pub fn alternate_address_delay(mut self, delay: Duration) -> Self {
        self.alternate_delay = delay;
        self
    }

    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }

    /// Apply the `[tcp]` section of a config file
    pub fn config(mut self, config: &TcpConfig) -> Self {
        self.options = config.options();
        self.alternate_delay = Duration::from_millis(config.alternate_address_delay_ms);
        self.read_chunk_size = config.read_chunk_size;
        self
    }

    /// Wrap a stream that is already connected, e.g. one from a listener
    ///
    /// The socket starts out connected and `did_connect` is not called.
    pub fn connected_stream(mut self, stream: std::net::TcpStream) -> Self {
        self.stream = Some(stream);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.read_chunk_size == 0 {
            return Err(Error::BadConfig("read chunk size must be positive".into()));
        }
        if self.options.both_disabled() {
            return Err(Error::BadConfig("both IPv4 and IPv6 are disabled".into()));
        }
        Ok(())
    }

    /// Spawn the engine; must be called inside a Tokio runtime
    pub fn build(mut self) -> Result<TcpSocket> {
        self.validate()?;
        let stream = match self.stream.take() {
            Some(stream) => Some(crate::socket::adopt_tcp(stream)?),
            None => None,
        };
        Ok(TcpEngine::spawn(self, stream))
    }
}
