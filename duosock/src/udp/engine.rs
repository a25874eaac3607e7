//! The UDP engine task
//!
//! Same shape as the TCP engine: one task owns both OS sockets, the send
//! queue and the send timer, waits on commands, internal events and
//! readiness, then runs `pump()` and publishes a fresh `UdpInfo`.
//!
//! Connect requests travel through the send queue so that sends queued
//! after a connect see the connected peer.

use std::collections::VecDeque;
use std::future::Future;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use duo_resolve::ResolvedAddresses;
use tokio::net::UdpSocket as TokioUdpSocket;
use tokio::sync::{mpsc, watch};

use super::packet::{
    check_address, family_usable, pick_address, ConnectPacket, FilterState, SendItem, SendPacket,
    Target,
};
use super::{
    BindTarget, Command, FilterMode, FilterVerdict, ReceiveFilter, ReceiveMode, SendFilter,
    SendTarget, Setting, Shared, UdpInfo, UdpSocket, UdpSocketBuilder,
};
use crate::error::{Error, Result};
use crate::event::{DelegateQueue, FilterContext, UdpSocketDelegate};
use crate::flags::{Options, SocketFlags};
use crate::socket::{self, Family};
use crate::state::{SocketId, StateIndex};
use crate::timer::Timer;
use crate::Tag;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Datagrams read per readiness event before other work gets a turn
const MAX_RECEIVES_PER_PASS: usize = 32;

enum Event {
    Resolved {
        stamp: StateIndex,
        packet: u64,
        result: duo_resolve::Result<ResolvedAddresses>,
    },
    SendFiltered {
        stamp: StateIndex,
        packet: u64,
        allowed: bool,
    },
    ReceiveFiltered {
        stamp: StateIndex,
        data: Vec<u8>,
        from: SocketAddr,
        verdict: FilterVerdict,
    },
    /// A receive filter panicked
    FilterAbandoned {
        stamp: StateIndex,
    },
}

impl Event {
    fn stamp(&self) -> StateIndex {
        match self {
            Event::Resolved { stamp, .. }
            | Event::SendFiltered { stamp, .. }
            | Event::ReceiveFiltered { stamp, .. }
            | Event::FilterAbandoned { stamp } => *stamp,
        }
    }
}

/// Filter call queued for the blocking pool
struct FilterJob {
    run: Box<dyn FnOnce() -> Event + Send>,
    /// Posted instead when `run` panics
    on_panic: Event,
}

/// Run filter jobs one after another, in submission order
fn spawn_filter_worker(
    id: SocketId,
    events: mpsc::UnboundedSender<Event>,
) -> mpsc::UnboundedSender<FilterJob> {
    let (jobs, mut rx) = mpsc::unbounded_channel::<FilterJob>();
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let event = match tokio::task::spawn_blocking(job.run).await {
                Ok(event) => event,
                Err(e) => {
                    log::error!("{} filter failed: {}", id, e);
                    job.on_panic
                }
            };
            if events.send(event).is_err() {
                break;
            }
        }
        log::trace!("{} filter worker stopped", id);
    });
    jobs
}

pub(super) struct UdpEngine {
    id: SocketId,
    handle: Weak<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<Event>,
    events: mpsc::UnboundedReceiver<Event>,
    info_tx: watch::Sender<UdpInfo>,

    delegate: Option<Arc<dyn UdpSocketDelegate>>,
    queue: Option<DelegateQueue>,
    outbox: Vec<Job>,

    flags: SocketFlags,
    options: Options,
    index: StateIndex,
    max_receive_v4: usize,
    max_receive_v6: usize,
    max_send: usize,
    reuse_port: bool,
    next_packet_id: u64,

    v4: Option<TokioUdpSocket>,
    v6: Option<TokioUdpSocket>,
    local_v4: Option<SocketAddr>,
    local_v6: Option<SocketAddr>,
    connected: Option<SocketAddr>,

    send_queue: VecDeque<SendItem>,
    current_send: Option<SendItem>,
    send_timer: Timer,

    send_filter: Option<(SendFilter, FilterMode)>,
    receive_filter: Option<(ReceiveFilter, FilterMode)>,
    filter_jobs: Option<mpsc::UnboundedSender<FilterJob>>,
    /// Async receive filter calls not answered yet
    pending_filter_ops: usize,
    recv_buf: Vec<u8>,
}

impl UdpEngine {
    pub(super) fn spawn(builder: UdpSocketBuilder) -> UdpSocket {
        let id = SocketId::new();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (info_tx, info) = watch::channel(UdpInfo::default());

        let shared = Arc::new(Shared {
            id,
            commands: commands_tx,
            info,
        });

        let engine = UdpEngine {
            id,
            handle: Arc::downgrade(&shared),
            commands,
            events_tx,
            events,
            info_tx,
            delegate: builder.delegate,
            queue: builder.queue,
            outbox: Vec::new(),
            flags: SocketFlags::empty(),
            options: builder.options,
            index: StateIndex::default(),
            max_receive_v4: builder.max_receive_ipv4_size,
            max_receive_v6: builder.max_receive_ipv6_size,
            max_send: builder.max_send_size,
            reuse_port: builder.reuse_port,
            next_packet_id: 0,
            v4: None,
            v6: None,
            local_v4: None,
            local_v6: None,
            connected: None,
            send_queue: VecDeque::new(),
            current_send: None,
            send_timer: Timer::new(),
            send_filter: None,
            receive_filter: None,
            filter_jobs: None,
            pending_filter_ops: 0,
            recv_buf: Vec::new(),
        };
        engine.publish();

        tokio::spawn(engine.run());
        UdpSocket::from_shared(shared)
    }

    async fn run(mut self) {
        log::trace!("{} engine started", self.id);

        while !self.flags.contains(SocketFlags::CLOSED) {
            let want_receive = self.want_receive();
            let send_family = self.ready_send_family();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        log::debug!("{} every handle was dropped", self.id);
                        self.close(None);
                    }
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                ready = readable(self.v4.as_ref()), if want_receive => match ready {
                    Ok(()) => self.receive_pass(),
                    Err(e) => self.close(Some(e.into())),
                },
                ready = readable(self.v6.as_ref()), if want_receive => match ready {
                    Ok(()) => self.receive_pass(),
                    Err(e) => self.close(Some(e.into())),
                },
                ready = writable(match send_family {
                    Some(Family::V4) => self.v4.as_ref(),
                    Some(Family::V6) => self.v6.as_ref(),
                    None => None,
                }), if send_family.is_some() => match ready {
                    Ok(()) => self.on_send_writable(),
                    Err(e) => self.close(Some(e.into())),
                },
                _ = self.send_timer.expired() => self.on_send_timeout(),
            }

            self.pump();
        }

        log::trace!("{} engine stopped", self.id);
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetDelegate(delegate, queue) => {
                self.delegate = Some(delegate);
                if queue.is_some() {
                    self.queue = queue;
                }
            }
            Command::Configure(setting) => self.configure(setting),
            Command::Bind { target, reply } => {
                let result = self.bind(target);
                self.reply("bind", reply, result);
            }
            Command::Connect { host, port, reply } => {
                let result = self.connect(host, port);
                self.reply("connect", reply, result);
            }
            Command::Send {
                data,
                target,
                timeout,
                tag,
            } => self.enqueue_send(data, target, timeout, tag),
            Command::Receive { mode, reply } => {
                let result = self.start_receiving(mode);
                self.reply("receive", reply, result);
            }
            Command::PauseReceiving => {
                self.flags
                    .remove(SocketFlags::RECEIVE_ONCE | SocketFlags::RECEIVE_CONTINUOUS);
            }
            Command::Multicast {
                group,
                interface,
                join,
                reply,
            } => {
                let result = self.multicast(&group, interface.as_deref(), join);
                self.reply(if join { "join" } else { "leave" }, reply, result);
            }
            Command::Broadcast { enabled, reply } => {
                let result = self.set_broadcast(enabled);
                self.reply("broadcast", reply, result);
            }
            Command::ReusePort { enabled, reply } => {
                let result = self.set_reuse_port(enabled);
                self.reply("reuse port", reply, result);
            }
            Command::SendFilter(filter) => self.send_filter = filter,
            Command::ReceiveFilter(filter) => self.receive_filter = filter,
            Command::Close => self.close(None),
            Command::CloseAfterSending => {
                self.flags
                    .insert(SocketFlags::FORBID_IO | SocketFlags::CLOSE_AFTER_SENDS);
            }
        }
    }

    fn reply(&self, what: &str, reply: tokio::sync::oneshot::Sender<Result<()>>, result: Result<()>) {
        if let Err(e) = &result {
            log::warn!("{} {} rejected: {}", self.id, what, e);
        }
        let _ = reply.send(result);
    }

    fn configure(&mut self, setting: Setting) {
        match setting {
            Setting::Ipv4Enabled(enabled) => self.options.set_ipv4_enabled(enabled),
            Setting::Ipv6Enabled(enabled) => self.options.set_ipv6_enabled(enabled),
            Setting::PreferIpv4 => self.options.set_prefer_ipv4(),
            Setting::PreferIpv6 => self.options.set_prefer_ipv6(),
            Setting::MaxReceiveIpv4Size(size) => {
                if let Some(size) = self.positive_size("IPv4 receive", size) {
                    self.max_receive_v4 = size;
                }
            }
            Setting::MaxReceiveIpv6Size(size) => {
                if let Some(size) = self.positive_size("IPv6 receive", size) {
                    self.max_receive_v6 = size;
                }
            }
            Setting::MaxSendSize(size) => {
                if let Some(size) = self.positive_size("send", size) {
                    self.max_send = size;
                }
            }
        }
    }

    /// Datagram size limits must stay positive, as the builder requires
    fn positive_size(&self, what: &str, size: usize) -> Option<usize> {
        if size == 0 {
            log::warn!("{} ignoring zero maximum {} size", self.id, what);
            None
        } else {
            Some(size)
        }
    }

    fn next_packet_id(&mut self) -> u64 {
        self.next_packet_id += 1;
        self.next_packet_id
    }

    fn usable(&self, family: Family) -> bool {
        family_usable(family, self.options, self.flags)
    }

    fn socket(&self, family: Family) -> Option<&TokioUdpSocket> {
        match family {
            Family::V4 => self.v4.as_ref(),
            Family::V6 => self.v6.as_ref(),
        }
    }

    // ========================================================================
    // Socket setup
    // ========================================================================

    /// Create the per-family sockets on first use
    ///
    /// A family that fails to open is deactivated as long as the other one
    /// works.
    fn ensure_sockets(&mut self) -> Result<()> {
        if self
            .flags
            .intersects(SocketFlags::DID_CREATE_IPV4 | SocketFlags::DID_CREATE_IPV6)
        {
            return Ok(());
        }

        let use_v4 = self.usable(Family::V4);
        let use_v6 = self.usable(Family::V6);
        if !use_v4 && !use_v6 {
            return Err(Error::BadConfig(
                "both IPv4 and IPv6 have been disabled or deactivated".into(),
            ));
        }

        let mut last_error = None;
        for family in [Family::V4, Family::V6] {
            let wanted = match family {
                Family::V4 => use_v4,
                Family::V6 => use_v6,
            };
            if !wanted {
                continue;
            }
            match socket::udp_socket(family, self.reuse_port) {
                Ok(sock) => match family {
                    Family::V4 => {
                        self.v4 = Some(sock);
                        self.flags.insert(SocketFlags::DID_CREATE_IPV4);
                    }
                    Family::V6 => {
                        self.v6 = Some(sock);
                        self.flags.insert(SocketFlags::DID_CREATE_IPV6);
                    }
                },
                Err(e) => {
                    log::warn!("{} cannot open {} socket: {}", self.id, family, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if self.v4.is_none() && self.v6.is_none() => Err(e.into()),
            Some(_) => {
                let failed = if self.v4.is_none() {
                    Family::V4
                } else {
                    Family::V6
                };
                self.drop_family(failed);
                Ok(())
            }
            None => {
                log::debug!("{} created sockets ({})", self.id, self.flags);
                Ok(())
            }
        }
    }

    /// Close one family's socket for the rest of the socket's life
    fn drop_family(&mut self, family: Family) {
        match family {
            Family::V4 => {
                self.v4 = None;
                self.local_v4 = None;
                self.flags.remove(SocketFlags::DID_CREATE_IPV4);
                self.flags.insert(SocketFlags::IPV4_DEACTIVATED);
            }
            Family::V6 => {
                self.v6 = None;
                self.local_v6 = None;
                self.flags.remove(SocketFlags::DID_CREATE_IPV6);
                self.flags.insert(SocketFlags::IPV6_DEACTIVATED);
            }
        }
        log::debug!("{} {} deactivated", self.id, family);
    }

    fn refresh_local(&mut self) {
        let bound = |sock: Option<&TokioUdpSocket>| {
            sock.and_then(|s| s.local_addr().ok())
                .filter(|a| a.port() != 0)
        };
        self.local_v4 = bound(self.v4.as_ref());
        self.local_v6 = bound(self.v6.as_ref());
    }

    fn bind(&mut self, target: BindTarget) -> Result<()> {
        if self.flags.contains(SocketFlags::DID_BIND) {
            return Err(Error::BadConfig("cannot bind a socket more than once".into()));
        }
        if self
            .flags
            .intersects(SocketFlags::CONNECTING | SocketFlags::CONNECTED)
        {
            return Err(Error::BadConfig("cannot bind after connecting".into()));
        }
        if !self.usable(Family::V4) && !self.usable(Family::V6) {
            return Err(Error::BadConfig(
                "both IPv4 and IPv6 have been disabled or deactivated".into(),
            ));
        }

        let (want_v4, want_v6) = match target {
            BindTarget::Port {
                port,
                interface: None,
            } => {
                let (v4, v6) = duo_resolve::any_addresses(port);
                (Some(SocketAddr::V4(v4)), Some(SocketAddr::V6(v6)))
            }
            BindTarget::Port {
                port,
                interface: Some(descriptor),
            } => {
                let local = duo_resolve::resolve_interface(&descriptor, port).map_err(|e| {
                    Error::BadParam(format!("unknown interface {}: {}", descriptor, e))
                })?;
                (local.v4.map(SocketAddr::V4), local.v6.map(SocketAddr::V6))
            }
            BindTarget::Address(addr) => {
                check_address(addr, self.options, self.flags)?;
                match addr {
                    SocketAddr::V4(_) => (Some(addr), None),
                    SocketAddr::V6(_) => (None, Some(addr)),
                }
            }
        };

        let want_v4 = want_v4.filter(|_| self.usable(Family::V4));
        let want_v6 = want_v6.filter(|_| self.usable(Family::V6));
        if want_v4.is_none() && want_v6.is_none() {
            return Err(Error::BadParam(
                "no address to bind in an enabled family".into(),
            ));
        }

        self.ensure_sockets()?;

        for (family, addr) in [(Family::V4, want_v4), (Family::V6, want_v6)] {
            let Some(sock) = self.socket(family) else {
                continue;
            };
            match addr {
                Some(addr) => socket::bind_udp(sock, addr)?,
                None => self.drop_family(family),
            }
        }
        if self.v4.is_none() && self.v6.is_none() {
            return Err(Error::BadParam(
                "no socket left to bind in an enabled family".into(),
            ));
        }

        self.flags.insert(SocketFlags::DID_BIND);
        self.refresh_local();
        log::info!(
            "{} bound to {:?} / {:?}",
            self.id,
            self.local_v4,
            self.local_v6
        );
        Ok(())
    }

    fn set_broadcast(&mut self, enabled: bool) -> Result<()> {
        self.ensure_sockets()?;
        let Some(sock) = self.v4.as_ref() else {
            return Err(Error::BadConfig(
                "broadcast needs IPv4, which is disabled or deactivated".into(),
            ));
        };
        sock.set_broadcast(enabled)?;
        Ok(())
    }

    fn set_reuse_port(&mut self, enabled: bool) -> Result<()> {
        if self.flags.contains(SocketFlags::DID_BIND) {
            return Err(Error::BadConfig(
                "port reuse must be set before binding".into(),
            ));
        }
        self.reuse_port = enabled;
        if let Some(sock) = self.v4.as_ref() {
            socket::set_reuse_port(sock, enabled)?;
        }
        if let Some(sock) = self.v6.as_ref() {
            socket::set_reuse_port(sock, enabled)?;
        }
        Ok(())
    }

    fn multicast(&mut self, group: &str, interface: Option<&str>, join: bool) -> Result<()> {
        let Some(group_addr) = duo_resolve::numeric_host(group, 0) else {
            return Err(Error::BadParam(format!(
                "multicast group {} must be a numeric address",
                group
            )));
        };
        if !group_addr.ip().is_multicast() {
            return Err(Error::BadParam(format!(
                "{} is not a multicast address",
                group
            )));
        }
        let local = match interface {
            Some(descriptor) => Some(duo_resolve::resolve_interface(descriptor, 0).map_err(
                |e| Error::BadParam(format!("unknown interface {}: {}", descriptor, e)),
            )?),
            None => None,
        };

        self.ensure_sockets()?;

        let family = Family::of(&group_addr);
        let Some(sock) = self.socket(family) else {
            return Err(Error::BadConfig(format!(
                "{} is disabled or deactivated, cannot use group {}",
                family, group
            )));
        };

        match group_addr {
            SocketAddr::V4(group_v4) => {
                let iface = match &local {
                    Some(local) => Some(local.v4.ok_or_else(|| {
                        Error::BadParam("interface has no IPv4 address".into())
                    })?),
                    None => None,
                };
                socket::multicast_v4(sock, group_v4, iface, join)?;
            }
            SocketAddr::V6(group_v6) => {
                let index = match &local {
                    Some(local) => local.index.ok_or_else(|| {
                        Error::BadParam("interface index is unknown".into())
                    })?,
                    None => 0,
                };
                socket::multicast_v6(sock, group_v6, index, join)?;
            }
        }

        if self.socket(family.other()).is_some() || self.usable(family.other()) {
            self.drop_family(family.other());
        }
        log::info!(
            "{} {} multicast group {}",
            self.id,
            if join { "joined" } else { "left" },
            group
        );
        Ok(())
    }

    // ========================================================================
    // Connecting and sending
    // ========================================================================

    fn connect(&mut self, host: String, port: u16) -> Result<()> {
        if self
            .flags
            .intersects(SocketFlags::CONNECTING | SocketFlags::CONNECTED)
        {
            return Err(Error::BadConfig(
                "cannot connect a socket more than once".into(),
            ));
        }
        if host.is_empty() {
            return Err(Error::BadParam("host must not be empty".into()));
        }
        self.ensure_sockets()?;

        let id = self.next_packet_id();
        let target = match (SendTarget::Host { host, port }).into_target() {
            Ok(target) => target,
            Err((host, port)) => {
                self.spawn_lookup(id, host, port);
                Target::Resolving
            }
        };

        self.flags.insert(SocketFlags::CONNECTING);
        self.send_queue
            .push_back(SendItem::Connect(ConnectPacket { id, target }));
        Ok(())
    }

    fn spawn_lookup(&self, packet: u64, host: String, port: u16) {
        log::debug!("{} resolving {}:{}", self.id, host, port);
        let events = self.events_tx.clone();
        let stamp = self.index;
        tokio::spawn(async move {
            let result = duo_resolve::lookup_host(&host, port).await;
            let _ = events.send(Event::Resolved {
                stamp,
                packet,
                result,
            });
        });
    }

    fn enqueue_send(&mut self, data: Vec<u8>, target: SendTarget, timeout: Option<Duration>, tag: Tag) {
        if self.flags.contains(SocketFlags::FORBID_IO) {
            log::debug!("{} send (tag {}) dropped, I/O is forbidden", self.id, tag);
            return;
        }
        if data.len() > self.max_send {
            let error = Error::BadParam(format!(
                "{}-byte datagram exceeds the {}-byte maximum",
                data.len(),
                self.max_send
            ));
            self.send_finished(tag, Err(error));
            return;
        }
        if let Err(e) = self.ensure_sockets() {
            self.send_finished(tag, Err(e));
            return;
        }

        let id = self.next_packet_id();
        let target = match target.into_target() {
            Ok(target) => target,
            Err((host, port)) => {
                self.spawn_lookup(id, host, port);
                Target::Resolving
            }
        };
        self.send_queue
            .push_back(SendItem::Send(SendPacket::new(id, data, target, timeout, tag)));
    }

    /// Advance the send queue head; true when it finished
    fn step_sends(&mut self) -> bool {
        if self.current_send.is_none() {
            let Some(item) = self.send_queue.pop_front() else {
                if self.flags.contains(SocketFlags::CLOSE_AFTER_SENDS) {
                    log::debug!("{} send queue drained", self.id);
                    self.close(None);
                }
                return false;
            };
            match &item {
                SendItem::Send(packet) => self.send_timer.start(packet.timeout),
                SendItem::Connect(_) => self.send_timer.cancel(),
            }
            self.current_send = Some(item);
        }

        match self.current_send.take() {
            Some(SendItem::Connect(packet)) => self.process_connect(packet),
            Some(SendItem::Send(packet)) => self.prepare_send(packet),
            None => false,
        }
    }

    fn process_connect(&mut self, packet: ConnectPacket) -> bool {
        if matches!(packet.target, Target::Resolving) {
            self.current_send = Some(SendItem::Connect(packet));
            return false;
        }

        let picked = match packet.target {
            Target::Failed(e) => Err(e),
            Target::Address(addr) => check_address(addr, self.options, self.flags),
            Target::Resolved(addrs) => pick_address(&addrs, self.options, self.flags),
            Target::Connected | Target::Resolving => {
                Err(Error::Other("connect request has no destination".into()))
            }
        };
        self.flags.remove(SocketFlags::CONNECTING);

        match picked.and_then(|addr| self.connect_socket(addr)) {
            Ok(addr) => {
                self.flags.insert(SocketFlags::CONNECTED);
                self.connected = Some(addr);
                let other = Family::of(&addr).other();
                if self.socket(other).is_some() || self.usable(other) {
                    self.drop_family(other);
                }
                self.refresh_local();
                log::info!("{} connected to {}", self.id, addr);
                self.notify(move |d, sock| async move { d.did_connect(&sock, addr).await });
            }
            Err(e) => {
                log::warn!("{} connect failed: {}", self.id, e);
                self.notify(move |d, sock| async move { d.did_not_connect(&sock, e).await });
            }
        }
        true
    }

    fn connect_socket(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let family = Family::of(&addr);
        let sock = self.socket(family).ok_or_else(|| {
            Error::BadConfig(format!("no {} socket to connect to {}", family, addr))
        })?;
        socket::connect_udp(sock, addr)?;
        Ok(addr)
    }

    /// Address and filter the head packet; true when it finished early
    fn prepare_send(&mut self, mut packet: SendPacket) -> bool {
        if matches!(packet.target, Target::Resolving) || packet.filter == FilterState::Pending {
            self.current_send = Some(SendItem::Send(packet));
            return false;
        }

        let dest = match packet.dest {
            // addressed before its family was dropped by a connect or a
            // multicast membership change
            Some(dest) if self.socket(Family::of(&dest)).is_none() => {
                let error = Error::BadConfig(format!(
                    "{} was deactivated before {} could be sent to",
                    Family::of(&dest),
                    dest
                ));
                self.send_finished(packet.tag, Err(error));
                return true;
            }
            Some(dest) => dest,
            None => match self.pick_destination(&packet.target) {
                Ok(dest) => {
                    packet.dest = Some(dest);
                    dest
                }
                Err(e) => {
                    self.send_finished(packet.tag, Err(e));
                    return true;
                }
            },
        };

        if packet.filter == FilterState::Unchecked {
            match self.send_filter.clone() {
                None => packet.filter = FilterState::Passed,
                Some((filter, FilterMode::Sync)) => {
                    if !filter(&packet.data, dest, packet.tag) {
                        log::trace!("{} send filter dropped tag {}", self.id, packet.tag);
                        self.send_finished(packet.tag, Ok(()));
                        return true;
                    }
                    packet.filter = FilterState::Passed;
                }
                Some((filter, FilterMode::Async)) => {
                    packet.filter = FilterState::Pending;
                    let stamp = self.index;
                    let (id, tag, data) = (packet.id, packet.tag, packet.data.clone());
                    self.run_filter(FilterJob {
                        run: Box::new(move || Event::SendFiltered {
                            stamp,
                            packet: id,
                            allowed: filter(&data, dest, tag),
                        }),
                        on_panic: Event::SendFiltered {
                            stamp,
                            packet: id,
                            allowed: false,
                        },
                    });
                }
            }
        }

        self.current_send = Some(SendItem::Send(packet));
        false
    }

    fn pick_destination(&self, target: &Target) -> Result<SocketAddr> {
        let connected = self.flags.contains(SocketFlags::CONNECTED);
        let dest = match target {
            Target::Failed(e) => Err(e.clone()),
            Target::Connected => self.connected.ok_or_else(|| {
                Error::BadConfig("socket is not connected, a destination is required".into())
            }),
            _ if connected => Err(Error::BadConfig(
                "cannot give a destination to a connected socket".into(),
            )),
            Target::Address(addr) => check_address(*addr, self.options, self.flags),
            Target::Resolved(addrs) => pick_address(addrs, self.options, self.flags),
            Target::Resolving => Err(Error::Other("destination is still resolving".into())),
        }?;

        if self.socket(Family::of(&dest)).is_none() {
            return Err(Error::BadConfig(format!(
                "no {} socket to send to {}",
                Family::of(&dest),
                dest
            )));
        }
        Ok(dest)
    }

    fn ready_send_family(&self) -> Option<Family> {
        match &self.current_send {
            Some(SendItem::Send(packet)) if packet.is_ready() => packet
                .dest
                .map(|d| Family::of(&d))
                .filter(|family| self.socket(*family).is_some()),
            _ => None,
        }
    }

    fn on_send_writable(&mut self) {
        let Some(SendItem::Send(packet)) = self.current_send.as_ref() else {
            return;
        };
        let Some(dest) = packet.dest else {
            return;
        };
        let Some(sock) = self.socket(Family::of(&dest)) else {
            return;
        };

        let result = if self.connected.is_some() {
            sock.try_send(&packet.data)
        } else {
            sock.try_send_to(&packet.data, dest)
        };
        let tag = packet.tag;

        match result {
            Ok(n) => {
                log::trace!("{} sent {} bytes to {} (tag {})", self.id, n, dest, tag);
                self.current_send = None;
                self.send_finished(tag, Ok(()));
                if self.local_v4.is_none() && self.local_v6.is_none() {
                    self.refresh_local();
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                let error = Error::from(e);
                self.current_send = None;
                self.send_finished(tag, Err(error.clone()));
                self.close(Some(error));
            }
        }
    }

    fn on_send_timeout(&mut self) {
        self.send_timer.cancel();
        match self.current_send.take() {
            Some(SendItem::Send(packet)) => {
                log::debug!("{} send timed out (tag {})", self.id, packet.tag);
                self.send_finished(packet.tag, Err(Error::SendTimeout));
            }
            other => self.current_send = other,
        }
    }

    /// Report the end of a send; the head slot must already be cleared
    fn send_finished(&mut self, tag: Tag, result: Result<()>) {
        self.send_timer.cancel();
        match result {
            Ok(()) => {
                self.notify(move |d, sock| async move { d.did_send(&sock, tag).await });
            }
            Err(error) => {
                log::warn!("{} send failed (tag {}): {}", self.id, tag, error);
                self.notify(move |d, sock| async move { d.did_not_send(&sock, tag, error).await });
            }
        }
    }

    // ========================================================================
    // Receiving
    // ========================================================================

    fn start_receiving(&mut self, mode: ReceiveMode) -> Result<()> {
        self.ensure_sockets()?;
        match mode {
            ReceiveMode::Once => {
                self.flags.remove(SocketFlags::RECEIVE_CONTINUOUS);
                self.flags.insert(SocketFlags::RECEIVE_ONCE);
            }
            ReceiveMode::Continuous => {
                self.flags.remove(SocketFlags::RECEIVE_ONCE);
                self.flags.insert(SocketFlags::RECEIVE_CONTINUOUS);
            }
        }
        Ok(())
    }

    fn want_receive(&self) -> bool {
        if self.flags.contains(SocketFlags::RECEIVE_CONTINUOUS) {
            return true;
        }
        // one-shot mode waits for filter verdicts before reading more
        self.flags.contains(SocketFlags::RECEIVE_ONCE) && self.pending_filter_ops == 0
    }

    fn receive_pass(&mut self) {
        for _ in 0..MAX_RECEIVES_PER_PASS {
            if self.flags.contains(SocketFlags::CLOSED) || !self.want_receive() {
                break;
            }
            if !self.receive_one() {
                break;
            }
        }
    }

    /// Read one datagram, alternating families when both have data
    fn receive_one(&mut self) -> bool {
        let order = if self.flags.contains(SocketFlags::FLIP_FLOP) {
            [Family::V6, Family::V4]
        } else {
            [Family::V4, Family::V6]
        };
        let both = self.v4.is_some() && self.v6.is_some();

        for family in order {
            let max = match family {
                Family::V4 => self.max_receive_v4,
                Family::V6 => self.max_receive_v6,
            };
            if self.recv_buf.len() < max {
                self.recv_buf.resize(max, 0);
            }
            let sock = match family {
                Family::V4 => self.v4.as_ref(),
                Family::V6 => self.v6.as_ref(),
            };
            let Some(sock) = sock else {
                continue;
            };

            match sock.try_recv_from(&mut self.recv_buf[..max]) {
                Ok((n, from)) => {
                    let data = self.recv_buf[..n].to_vec();
                    if both {
                        self.flags.set(SocketFlags::FLIP_FLOP, family == Family::V4);
                    }
                    self.accept_datagram(data, from);
                    return true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    self.close(Some(e.into()));
                    return false;
                }
            }
        }
        false
    }

    fn accept_datagram(&mut self, data: Vec<u8>, from: SocketAddr) {
        if let Some(peer) = self.connected {
            if from != peer {
                log::debug!("{} ignoring datagram from {} (connected to {})", self.id, from, peer);
                return;
            }
        }

        match self.receive_filter.clone() {
            None => self.deliver(data, from, None),
            Some((filter, FilterMode::Sync)) => match filter(&data, from) {
                FilterVerdict::Accept(context) => self.deliver(data, from, context),
                FilterVerdict::Reject => {
                    log::trace!("{} receive filter dropped datagram from {}", self.id, from);
                }
            },
            Some((filter, FilterMode::Async)) => {
                self.pending_filter_ops += 1;
                let stamp = self.index;
                self.run_filter(FilterJob {
                    run: Box::new(move || {
                        let verdict = filter(&data, from);
                        Event::ReceiveFiltered {
                            stamp,
                            data,
                            from,
                            verdict,
                        }
                    }),
                    on_panic: Event::FilterAbandoned { stamp },
                });
            }
        }
    }

    fn deliver(&mut self, data: Vec<u8>, from: SocketAddr, context: Option<FilterContext>) {
        self.flags.remove(SocketFlags::RECEIVE_ONCE);
        log::trace!("{} received {} bytes from {}", self.id, data.len(), from);
        self.notify(move |d, sock| async move { d.did_receive(&sock, data, from, context).await });
    }

    fn run_filter(&mut self, job: FilterJob) {
        if self.filter_jobs.is_none() {
            self.filter_jobs = Some(spawn_filter_worker(self.id, self.events_tx.clone()));
        }
        if let Some(jobs) = &self.filter_jobs {
            if jobs.send(job).is_err() {
                log::warn!("{} filter worker is gone", self.id);
            }
        }
    }

    // ========================================================================
    // Events
    // ========================================================================

    fn handle_event(&mut self, event: Event) {
        if !self.index.is_current(event.stamp()) {
            log::trace!("{} dropping stale event", self.id);
            return;
        }

        match event {
            Event::Resolved { packet, result, .. } => {
                let target = match result {
                    Ok(addrs) => Target::Resolved(addrs),
                    Err(e) => Target::Failed(e.into()),
                };
                let slot = self
                    .current_send
                    .iter_mut()
                    .chain(self.send_queue.iter_mut())
                    .find(|item| item.id() == packet);
                match slot {
                    Some(item) => *item.target_mut() = target,
                    None => log::trace!("{} lookup for dropped packet {} ignored", self.id, packet),
                }
            }

            Event::SendFiltered {
                packet, allowed, ..
            } => {
                let Some(SendItem::Send(current)) = self.current_send.as_mut() else {
                    return;
                };
                if current.id != packet || current.filter != FilterState::Pending {
                    return;
                }
                if allowed {
                    current.filter = FilterState::Passed;
                } else {
                    let tag = current.tag;
                    log::trace!("{} send filter dropped tag {}", self.id, tag);
                    self.current_send = None;
                    self.send_finished(tag, Ok(()));
                }
            }

            Event::ReceiveFiltered {
                data,
                from,
                verdict,
                ..
            } => {
                self.pending_filter_ops = self.pending_filter_ops.saturating_sub(1);
                match verdict {
                    FilterVerdict::Accept(context)
                        if self.flags.intersects(
                            SocketFlags::RECEIVE_ONCE | SocketFlags::RECEIVE_CONTINUOUS,
                        ) =>
                    {
                        self.deliver(data, from, context)
                    }
                    FilterVerdict::Accept(_) => {
                        log::debug!("{} receiving paused, dropping datagram from {}", self.id, from);
                    }
                    FilterVerdict::Reject => {
                        log::trace!("{} receive filter dropped datagram from {}", self.id, from);
                    }
                }
            }

            Event::FilterAbandoned { .. } => {
                self.pending_filter_ops = self.pending_filter_ops.saturating_sub(1);
            }
        }
    }

    // ========================================================================
    // Teardown and notification
    // ========================================================================

    fn pump(&mut self) {
        while !self.flags.contains(SocketFlags::CLOSED) && self.step_sends() {}
        self.publish();
        self.flush_outbox();
    }

    fn close(&mut self, error: Option<Error>) {
        if self.flags.contains(SocketFlags::CLOSED) {
            return;
        }
        self.index.advance();

        self.send_timer.cancel();
        self.send_queue.clear();
        self.current_send = None;
        self.filter_jobs = None;
        self.pending_filter_ops = 0;

        let had_sockets = self
            .flags
            .intersects(SocketFlags::DID_CREATE_IPV4 | SocketFlags::DID_CREATE_IPV6);
        self.v4 = None;
        self.v6 = None;
        self.local_v4 = None;
        self.local_v6 = None;
        self.connected = None;
        self.flags = SocketFlags::CLOSED;

        match &error {
            Some(e) => log::warn!("{} closed: {}", self.id, e),
            None => log::info!("{} closed", self.id),
        }

        if had_sockets {
            self.notify(move |d, sock| async move { d.did_close(&sock, error).await });
        }
    }

    /// Queue a delegate callback; false when nobody is listening
    fn notify<F, Fut>(&mut self, callback: F) -> bool
    where
        F: FnOnce(Arc<dyn UdpSocketDelegate>, UdpSocket) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(delegate) = self.delegate.clone() else {
            return false;
        };
        let Some(shared) = self.handle.upgrade() else {
            return false;
        };
        self.outbox
            .push(Box::pin(callback(delegate, UdpSocket::from_shared(shared))));
        true
    }

    fn flush_outbox(&mut self) {
        if self.outbox.is_empty() {
            return;
        }
        let id = self.id;
        let queue = self
            .queue
            .get_or_insert_with(|| DelegateQueue::new(format!("{}-delegate", id)));
        for job in self.outbox.drain(..) {
            queue.dispatch(job);
        }
    }

    fn publish(&self) {
        let info = UdpInfo {
            flags: self.flags,
            options: self.options,
            local_v4: self.local_v4,
            local_v6: self.local_v6,
            connected: self.connected,
            max_receive_ipv4_size: self.max_receive_v4,
            max_receive_ipv6_size: self.max_receive_v6,
            max_send_size: self.max_send,
            pending_sends: self
                .send_queue
                .iter()
                .filter(|i| matches!(i, SendItem::Send(_)))
                .count()
                + usize::from(matches!(self.current_send, Some(SendItem::Send(_)))),
        };

        self.info_tx.send_if_modified(|current| {
            if *current != info {
                *current = info;
                true
            } else {
                false
            }
        });
    }
}

async fn readable(sock: Option<&TokioUdpSocket>) -> io::Result<()> {
    match sock {
        Some(sock) => sock.readable().await,
        None => std::future::pending().await,
    }
}

async fn writable(sock: Option<&TokioUdpSocket>) -> io::Result<()> {
    match sock {
        Some(sock) => sock.writable().await,
        None => std::future::pending().await,
    }
}
