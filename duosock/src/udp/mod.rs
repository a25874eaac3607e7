//! UDP socket engine
//!
//! `UdpSocket` drives up to two OS sockets, one per address family, that
//! are created on first use. Sends go through a FIFO queue shared with
//! `connect` requests; receives are delivered once or continuously and
//! may be screened by a filter.

mod engine;
pub(crate) mod packet;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use crate::config::UdpConfig;
use crate::error::{Error, Result};
use crate::event::{DelegateQueue, FilterContext, UdpSocketDelegate};
use crate::flags::{Options, SocketFlags};
use crate::state::SocketId;
use crate::Tag;

use engine::UdpEngine;
use packet::Target;

/// Largest datagram payload accepted by default
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 65535;

/// Decision of a receive filter
#[derive(Clone)]
pub enum FilterVerdict {
    /// Deliver the datagram, optionally with a context for the delegate
    Accept(Option<FilterContext>),
    /// Drop it silently
    Reject,
}

impl std::fmt::Debug for FilterVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterVerdict::Accept(ctx) => write!(f, "Accept(context: {})", ctx.is_some()),
            FilterVerdict::Reject => write!(f, "Reject"),
        }
    }
}

/// Where a filter runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    /// Inline on the engine task; keep it cheap
    #[default]
    Sync,
    /// On the blocking pool, one call at a time, in arrival order
    Async,
}

/// Return false to drop an outgoing datagram; the send still reports success
pub type SendFilter = Arc<dyn Fn(&[u8], SocketAddr, Tag) -> bool + Send + Sync>;

/// Screen an incoming datagram
pub type ReceiveFilter = Arc<dyn Fn(&[u8], SocketAddr) -> FilterVerdict + Send + Sync>;

/// Snapshot of a UDP socket's state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UdpInfo {
    pub flags: SocketFlags,
    pub options: Options,
    pub local_v4: Option<SocketAddr>,
    pub local_v6: Option<SocketAddr>,
    /// Peer fixed by a successful connect
    pub connected: Option<SocketAddr>,
    pub max_receive_ipv4_size: usize,
    pub max_receive_ipv6_size: usize,
    pub max_send_size: usize,
    /// Queued sends, including the one in flight
    pub pending_sends: usize,
}

impl UdpInfo {
    pub fn is_closed(&self) -> bool {
        self.flags.contains(SocketFlags::CLOSED)
    }

    pub fn is_connected(&self) -> bool {
        self.flags.contains(SocketFlags::CONNECTED) && !self.is_closed()
    }

    /// Enabled by configuration and not deactivated by bind, connect or
    /// multicast
    pub fn is_ipv4_enabled(&self) -> bool {
        self.options.ipv4_enabled() && !self.flags.contains(SocketFlags::IPV4_DEACTIVATED)
    }

    pub fn is_ipv6_enabled(&self) -> bool {
        self.options.ipv6_enabled() && !self.flags.contains(SocketFlags::IPV6_DEACTIVATED)
    }

    /// The socket speaks IPv4: the connected peer is IPv4, or, when not
    /// connected, the IPv4 socket exists
    pub fn is_ipv4(&self) -> bool {
        match self.connected {
            Some(addr) => addr.is_ipv4(),
            None => self.flags.contains(SocketFlags::DID_CREATE_IPV4),
        }
    }

    pub fn is_ipv6(&self) -> bool {
        match self.connected {
            Some(addr) => addr.is_ipv6(),
            None => self.flags.contains(SocketFlags::DID_CREATE_IPV6),
        }
    }

    pub fn is_receiving(&self) -> bool {
        self.flags
            .intersects(SocketFlags::RECEIVE_ONCE | SocketFlags::RECEIVE_CONTINUOUS)
    }
}

pub(crate) enum Setting {
    Ipv4Enabled(bool),
    Ipv6Enabled(bool),
    PreferIpv4,
    PreferIpv6,
    MaxReceiveIpv4Size(usize),
    MaxReceiveIpv6Size(usize),
    MaxSendSize(usize),
}

pub(crate) enum BindTarget {
    Port {
        port: u16,
        interface: Option<String>,
    },
    Address(SocketAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReceiveMode {
    Once,
    Continuous,
}

pub(crate) enum Command {
    SetDelegate(Arc<dyn UdpSocketDelegate>, Option<DelegateQueue>),
    Configure(Setting),
    Bind {
        target: BindTarget,
        reply: oneshot::Sender<Result<()>>,
    },
    Connect {
        host: String,
        port: u16,
        reply: oneshot::Sender<Result<()>>,
    },
    Send {
        data: Vec<u8>,
        target: SendTarget,
        timeout: Option<Duration>,
        tag: Tag,
    },
    Receive {
        mode: ReceiveMode,
        reply: oneshot::Sender<Result<()>>,
    },
    PauseReceiving,
    Multicast {
        group: String,
        interface: Option<String>,
        join: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Broadcast {
        enabled: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    ReusePort {
        enabled: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    SendFilter(Option<(SendFilter, FilterMode)>),
    ReceiveFilter(Option<(ReceiveFilter, FilterMode)>),
    Close,
    CloseAfterSending,
}

/// Destination as given by the caller
pub(crate) enum SendTarget {
    Connected,
    Host { host: String, port: u16 },
    Address(SocketAddr),
}

impl SendTarget {
    /// Literal targets need no lookup; host names come back as `Err`
    pub(crate) fn into_target(self) -> std::result::Result<Target, (String, u16)> {
        match self {
            SendTarget::Connected => Ok(Target::Connected),
            SendTarget::Address(addr) => Ok(Target::Address(addr)),
            SendTarget::Host { host, port } => match duo_resolve::numeric_host(&host, port) {
                Some(addr) => Ok(Target::Address(addr)),
                None => Err((host, port)),
            },
        }
    }
}

pub(crate) struct Shared {
    id: SocketId,
    commands: mpsc::UnboundedSender<Command>,
    info: watch::Receiver<UdpInfo>,
}

/// Handle to a UDP socket engine
///
/// Clones share the engine. Dropping the last handle closes the socket.
#[derive(Clone)]
pub struct UdpSocket {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for UdpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info = self.info();
        f.debug_struct("UdpSocket")
            .field("id", &self.shared.id)
            .field("flags", &info.flags)
            .field("local_v4", &info.local_v4)
            .field("local_v6", &info.local_v6)
            .finish()
    }
}

impl UdpSocket {
    /// Create a socket with default settings and no delegate
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new() -> Self {
        UdpEngine::spawn(UdpSocketBuilder::default())
    }

    pub fn builder() -> UdpSocketBuilder {
        UdpSocketBuilder::default()
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> SocketId {
        self.shared.id
    }

    fn send_command(&self, command: Command) -> bool {
        if self.shared.commands.send(command).is_err() {
            log::debug!("{} engine has stopped, command dropped", self.shared.id);
            return false;
        }
        true
    }

    async fn request<F>(&self, make: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> Command,
    {
        let (reply, rx) = oneshot::channel();
        if !self.send_command(make(reply)) {
            return Err(Error::BadConfig("socket is closed".into()));
        }
        rx.await
            .unwrap_or_else(|_| Err(Error::BadConfig("socket is closed".into())))
    }

    pub fn set_delegate<D: UdpSocketDelegate>(&self, delegate: D, queue: Option<DelegateQueue>) {
        self.set_shared_delegate(Arc::new(delegate), queue);
    }

    pub fn set_shared_delegate(
        &self,
        delegate: Arc<dyn UdpSocketDelegate>,
        queue: Option<DelegateQueue>,
    ) {
        self.send_command(Command::SetDelegate(delegate, queue));
    }

    // ========================================================================
    // Binding and connecting
    // ========================================================================

    /// Bind every usable family to `port`
    ///
    /// `interface` narrows the bind to one interface name or local address
    /// (a `:port` suffix overrides `port`). A family the interface lacks is
    /// deactivated.
    pub async fn bind_to_port(&self, port: u16, interface: Option<&str>) -> Result<()> {
        let target = BindTarget::Port {
            port,
            interface: interface.map(str::to_string),
        };
        self.request(|reply| Command::Bind { target, reply }).await
    }

    /// Bind to one local address; the other family is deactivated
    pub async fn bind_to_address(&self, addr: SocketAddr) -> Result<()> {
        let target = BindTarget::Address(addr);
        self.request(|reply| Command::Bind { target, reply }).await
    }

    /// Fix the peer
    ///
    /// Returns once the request is queued. The connect runs in send-queue
    /// order and reports through `did_connect`/`did_not_connect`.
    pub async fn connect_to_host(&self, host: &str, port: u16) -> Result<()> {
        if host.is_empty() {
            return Err(Error::BadParam("host must not be empty".into()));
        }
        let host = host.to_string();
        self.request(|reply| Command::Connect { host, port, reply })
            .await
    }

    pub async fn connect_to_address(&self, addr: SocketAddr) -> Result<()> {
        let host = addr.ip().to_string();
        let port = addr.port();
        self.request(|reply| Command::Connect { host, port, reply })
            .await
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Send to the connected peer
    ///
    /// Every failure, including a bad argument, is reported through
    /// `did_not_send`.
    pub fn send(&self, data: impl Into<Vec<u8>>, timeout: Option<Duration>, tag: Tag) {
        self.enqueue_send(data.into(), SendTarget::Connected, timeout, tag);
    }

    /// Send to a host name or literal, resolved when queued
    pub fn send_to_host(
        &self,
        data: impl Into<Vec<u8>>,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
        tag: Tag,
    ) {
        let target = SendTarget::Host {
            host: host.to_string(),
            port,
        };
        self.enqueue_send(data.into(), target, timeout, tag);
    }

    pub fn send_to_address(
        &self,
        data: impl Into<Vec<u8>>,
        addr: SocketAddr,
        timeout: Option<Duration>,
        tag: Tag,
    ) {
        self.enqueue_send(data.into(), SendTarget::Address(addr), timeout, tag);
    }

    fn enqueue_send(&self, data: Vec<u8>, target: SendTarget, timeout: Option<Duration>, tag: Tag) {
        if data.is_empty() {
            log::warn!("{} ignoring send of empty datagram (tag {})", self.shared.id, tag);
            return;
        }
        self.send_command(Command::Send {
            data,
            target,
            timeout,
            tag,
        });
    }

    /// Screen outgoing datagrams
    pub fn set_send_filter<F>(&self, filter: F, mode: FilterMode)
    where
        F: Fn(&[u8], SocketAddr, Tag) -> bool + Send + Sync + 'static,
    {
        self.send_command(Command::SendFilter(Some((Arc::new(filter), mode))));
    }

    pub fn clear_send_filter(&self) {
        self.send_command(Command::SendFilter(None));
    }

    // ========================================================================
    // Receiving
    // ========================================================================

    /// Deliver the next datagram, then stop
    pub async fn receive_once(&self) -> Result<()> {
        self.request(|reply| Command::Receive {
            mode: ReceiveMode::Once,
            reply,
        })
        .await
    }

    /// Deliver datagrams until paused or closed
    pub async fn begin_receiving(&self) -> Result<()> {
        self.request(|reply| Command::Receive {
            mode: ReceiveMode::Continuous,
            reply,
        })
        .await
    }

    /// Stop delivering; datagrams wait in the kernel buffer
    pub fn pause_receiving(&self) {
        self.send_command(Command::PauseReceiving);
    }

    /// Screen incoming datagrams
    pub fn set_receive_filter<F>(&self, filter: F, mode: FilterMode)
    where
        F: Fn(&[u8], SocketAddr) -> FilterVerdict + Send + Sync + 'static,
    {
        self.send_command(Command::ReceiveFilter(Some((Arc::new(filter), mode))));
    }

    pub fn clear_receive_filter(&self) {
        self.send_command(Command::ReceiveFilter(None));
    }

    // ========================================================================
    // Socket options
    // ========================================================================

    /// Join a multicast group given as a numeric address
    ///
    /// The family of the group stays; the other one is deactivated.
    pub async fn join_multicast_group(&self, group: &str, interface: Option<&str>) -> Result<()> {
        self.multicast(group, interface, true).await
    }

    pub async fn leave_multicast_group(&self, group: &str, interface: Option<&str>) -> Result<()> {
        self.multicast(group, interface, false).await
    }

    async fn multicast(&self, group: &str, interface: Option<&str>, join: bool) -> Result<()> {
        let group = group.to_string();
        let interface = interface.map(str::to_string);
        self.request(|reply| Command::Multicast {
            group,
            interface,
            join,
            reply,
        })
        .await
    }

    /// Allow sending to broadcast addresses (IPv4 only)
    pub async fn enable_broadcast(&self, enabled: bool) -> Result<()> {
        self.request(|reply| Command::Broadcast { enabled, reply })
            .await
    }

    /// Share the port with other sockets; must precede bind
    pub async fn enable_reuse_port(&self, enabled: bool) -> Result<()> {
        self.request(|reply| Command::ReusePort { enabled, reply })
            .await
    }

    // ========================================================================
    // Closing
    // ========================================================================

    /// Close now, dropping queued sends
    pub fn close(&self) {
        self.send_command(Command::Close);
    }

    /// Refuse new sends and close once the queue drains
    pub fn close_after_sending(&self) {
        self.send_command(Command::CloseAfterSending);
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    pub fn set_ipv4_enabled(&self, enabled: bool) {
        self.send_command(Command::Configure(Setting::Ipv4Enabled(enabled)));
    }

    pub fn set_ipv6_enabled(&self, enabled: bool) {
        self.send_command(Command::Configure(Setting::Ipv6Enabled(enabled)));
    }

    pub fn set_prefer_ipv4(&self) {
        self.send_command(Command::Configure(Setting::PreferIpv4));
    }

    pub fn set_prefer_ipv6(&self) {
        self.send_command(Command::Configure(Setting::PreferIpv6));
    }

    pub fn set_max_receive_ipv4_buffer_size(&self, size: u16) {
        self.send_command(Command::Configure(Setting::MaxReceiveIpv4Size(
            usize::from(size),
        )));
    }

    pub fn set_max_receive_ipv6_buffer_size(&self, size: u32) {
        self.send_command(Command::Configure(Setting::MaxReceiveIpv6Size(size as usize)));
    }

    pub fn set_max_send_buffer_size(&self, size: u16) {
        self.send_command(Command::Configure(Setting::MaxSendSize(usize::from(size))));
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn info(&self) -> UdpInfo {
        self.shared.info.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.info.borrow().is_closed()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.info.borrow().is_connected()
    }

    pub fn is_ipv4(&self) -> bool {
        self.shared.info.borrow().is_ipv4()
    }

    pub fn is_ipv6(&self) -> bool {
        self.shared.info.borrow().is_ipv6()
    }

    pub fn is_ipv4_enabled(&self) -> bool {
        self.shared.info.borrow().is_ipv4_enabled()
    }

    pub fn is_ipv6_enabled(&self) -> bool {
        self.shared.info.borrow().is_ipv6_enabled()
    }

    pub fn local_address_v4(&self) -> Option<SocketAddr> {
        self.shared.info.borrow().local_v4
    }

    pub fn local_address_v6(&self) -> Option<SocketAddr> {
        self.shared.info.borrow().local_v6
    }

    /// Local port, IPv4 first
    pub fn local_port(&self) -> Option<u16> {
        let info = self.shared.info.borrow();
        info.local_v4.or(info.local_v6).map(|a| a.port())
    }

    pub fn local_host(&self) -> Option<String> {
        let info = self.shared.info.borrow();
        info.local_v4.or(info.local_v6).map(|a| a.ip().to_string())
    }

    pub fn connected_address(&self) -> Option<SocketAddr> {
        self.shared.info.borrow().connected
    }

    pub fn connected_host(&self) -> Option<String> {
        self.connected_address().map(|a| a.ip().to_string())
    }

    pub fn connected_port(&self) -> Option<u16> {
        self.connected_address().map(|a| a.port())
    }

    pub fn connected_ip(&self) -> Option<IpAddr> {
        self.connected_address().map(|a| a.ip())
    }

    /// Wait until the socket is torn down
    pub async fn closed(&self) {
        let mut info = self.shared.info.clone();
        let _ = info.wait_for(|i| i.is_closed()).await;
    }
}

impl Default for UdpSocket {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `UdpSocket`
pub struct UdpSocketBuilder {
    pub(crate) delegate: Option<Arc<dyn UdpSocketDelegate>>,
    pub(crate) queue: Option<DelegateQueue>,
    pub(crate) options: Options,
    pub(crate) max_receive_ipv4_size: usize,
    pub(crate) max_receive_ipv6_size: usize,
    pub(crate) max_send_size: usize,
    pub(crate) reuse_port: bool,
}

impl Default for UdpSocketBuilder {
    fn default() -> Self {
        Self {
            delegate: None,
            queue: None,
            options: Options::default(),
            max_receive_ipv4_size: DEFAULT_MAX_DATAGRAM_SIZE,
            max_receive_ipv6_size: DEFAULT_MAX_DATAGRAM_SIZE,
            max_send_size: DEFAULT_MAX_DATAGRAM_SIZE,
            reuse_port: false,
        }
    }
}

impl UdpSocketBuilder {
    pub fn delegate<D: UdpSocketDelegate>(mut self, delegate: D) -> Self {
        self.delegate = Some(Arc::new(delegate));
        self
    }

    pub fn shared_delegate(mut self, delegate: Arc<dyn UdpSocketDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

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

    pub fn max_receive_ipv4_size(mut self, size: u16) -> Self {
        self.max_receive_ipv4_size = usize::from(size);
        self
    }

    pub fn max_receive_ipv6_size(mut self, size: u32) -> Self {
        self.max_receive_ipv6_size = size as usize;
        self
    }

    pub fn max_send_size(mut self, size: u16) -> Self {
        self.max_send_size = usize::from(size);
        self
    }

    pub fn reuse_port(mut self, enabled: bool) -> Self {
        self.reuse_port = enabled;
        self
    }

    /// Apply the `[udp]` section of a config file
    pub fn config(mut self, config: &UdpConfig) -> Self {
        self.options = config.options();
        self.max_receive_ipv4_size = config.max_receive_ipv4_size;
        self.max_receive_ipv6_size = config.max_receive_ipv6_size;
        self.max_send_size = config.max_send_size;
        self.reuse_port = config.reuse_port;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.options.both_disabled() {
            return Err(Error::BadConfig("both IPv4 and IPv6 are disabled".into()));
        }
        if self.max_receive_ipv4_size == 0
            || self.max_receive_ipv6_size == 0
            || self.max_send_size == 0
        {
            return Err(Error::BadConfig("datagram sizes must be positive".into()));
        }
        Ok(())
    }

    /// Spawn the engine; must be called inside a Tokio runtime
    pub fn build(self) -> Result<UdpSocket> {
        self.validate()?;
        Ok(UdpEngine::spawn(self))
    }
}
