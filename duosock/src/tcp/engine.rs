//! The TCP engine task
//!
//! One task per socket owns every piece of mutable state. The loop waits
//! on handle commands, internal events (lookups, connect attempts, owner
//! replies), socket readiness and the three operation timers, then runs
//! `pump()` to move the queues forward and publish a fresh `TcpInfo`.
//!
//! Readiness is only awaited while something needs it: reads wait for
//! `readable()` when a read is in flight (or to notice EOF while idle),
//! writes wait for `writable()` when a write or TLS record is pending.

use std::collections::VecDeque;
use std::future::Future;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use duo_resolve::{InterfaceAddresses, ResolvedAddresses};
use duo_tls::{HandshakeStatus, SecurityContext, TlsError, TlsSettings};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::packet::{ReadItem, ReadKind, ReadPacket, ReadProgress, WriteItem, WritePacket};
use super::{
    Command, ConnectTarget, DisconnectMode, Setting, Shared, TcpInfo, TcpSocket, TcpSocketBuilder,
};
use crate::error::{Error, Result};
use crate::event::{DelegateQueue, TcpSocketDelegate, TrustCompletion};
use crate::flags::{Options, SocketFlags};
use crate::prebuffer::PreBuffer;
use crate::socket::{self, Family, StreamIo};
use crate::state::{SocketId, StateIndex};
use crate::timer::Timer;
use crate::Tag;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Results of work running off the engine task
enum Event {
    Resolved {
        stamp: StateIndex,
        result: duo_resolve::Result<ResolvedAddresses>,
    },
    Attempt {
        stamp: StateIndex,
        family: Family,
        result: io::Result<TcpStream>,
    },
    AlternateDue {
        stamp: StateIndex,
    },
    ConnectExtension {
        stamp: StateIndex,
        extension: Duration,
    },
    ReadExtension {
        stamp: StateIndex,
        packet: u64,
        extension: Duration,
    },
    WriteExtension {
        stamp: StateIndex,
        packet: u64,
        extension: Duration,
    },
    TrustDecision {
        stamp: StateIndex,
        trusted: bool,
    },
}

impl Event {
    fn stamp(&self) -> StateIndex {
        match self {
            Event::Resolved { stamp, .. }
            | Event::Attempt { stamp, .. }
            | Event::AlternateDue { stamp }
            | Event::ConnectExtension { stamp, .. }
            | Event::ReadExtension { stamp, .. }
            | Event::WriteExtension { stamp, .. }
            | Event::TrustDecision { stamp, .. } => *stamp,
        }
    }
}

pub(super) struct TcpEngine {
    id: SocketId,
    handle: Weak<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<Event>,
    events: mpsc::UnboundedReceiver<Event>,
    info_tx: watch::Sender<TcpInfo>,

    delegate: Option<Arc<dyn TcpSocketDelegate>>,
    queue: Option<DelegateQueue>,
    outbox: Vec<Job>,

    flags: SocketFlags,
    options: Options,
    index: StateIndex,
    alternate_delay: Duration,
    read_chunk_size: usize,
    next_packet_id: u64,

    // connection establishment
    host: Option<String>,
    interface: Option<InterfaceAddresses>,
    attempts: Vec<(Family, JoinHandle<()>)>,
    alternate: Option<SocketAddr>,
    alternate_timer: Option<JoinHandle<()>>,
    connect_timer: Timer,

    stream: Option<TcpStream>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,

    prebuffer: PreBuffer,
    read_queue: VecDeque<ReadItem>,
    current_read: Option<ReadPacket>,
    read_timer: Timer,
    write_queue: VecDeque<WriteItem>,
    current_write: Option<WritePacket>,
    write_timer: Timer,

    tls_settings: Option<TlsSettings>,
    tls: Option<SecurityContext>,
    trust_requested: bool,
}

impl TcpEngine {
    pub(super) fn spawn(builder: TcpSocketBuilder, stream: Option<TcpStream>) -> TcpSocket {
        let id = SocketId::new();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (info_tx, info) = watch::channel(TcpInfo {
            options: builder.options,
            ..Default::default()
        });

        let shared = Arc::new(Shared {
            id,
            commands: commands_tx,
            info,
        });

        let mut engine = TcpEngine {
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
            alternate_delay: builder.alternate_delay,
            read_chunk_size: builder.read_chunk_size,
            next_packet_id: 0,
            host: None,
            interface: None,
            attempts: Vec::new(),
            alternate: None,
            alternate_timer: None,
            connect_timer: Timer::new(),
            stream: None,
            local_addr: None,
            peer_addr: None,
            prebuffer: PreBuffer::new(),
            read_queue: VecDeque::new(),
            current_read: None,
            read_timer: Timer::new(),
            write_queue: VecDeque::new(),
            current_write: None,
            write_timer: Timer::new(),
            tls_settings: None,
            tls: None,
            trust_requested: false,
        };

        if let Some(stream) = stream {
            engine.adopt(stream);
        }
        engine.publish();

        tokio::spawn(engine.run());
        TcpSocket::from_shared(shared)
    }

    fn adopt(&mut self, stream: TcpStream) {
        self.local_addr = stream.local_addr().ok();
        self.peer_addr = stream.peer_addr().ok();
        self.host = self.peer_addr.map(|a| a.ip().to_string());
        self.stream = Some(stream);
        self.flags
            .insert(SocketFlags::STARTED | SocketFlags::CONNECTED);
        log::debug!(
            "{} adopted connected stream {:?} -> {:?}",
            self.id,
            self.local_addr,
            self.peer_addr
        );
    }

    async fn run(mut self) {
        log::trace!("{} engine started", self.id);

        while !self.flags.contains(SocketFlags::CLOSED) {
            let want_read = self.want_read();
            let want_write = self.want_write();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        log::debug!("{} every handle was dropped", self.id);
                        self.close(None);
                    }
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                ready = readable(self.stream.as_ref()), if want_read => match ready {
                    Ok(()) => self.on_readable(),
                    Err(e) => self.close(Some(e.into())),
                },
                ready = writable(self.stream.as_ref()), if want_write => match ready {
                    Ok(()) => self.on_writable(),
                    Err(e) => self.close(Some(e.into())),
                },
                _ = self.connect_timer.expired() => self.on_connect_timeout(),
                _ = self.read_timer.expired() => self.on_read_timeout(),
                _ = self.write_timer.expired() => self.on_write_timeout(),
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
            Command::Connect {
                target,
                timeout,
                reply,
            } => {
                let result = self.connect(target, timeout);
                if let Err(e) = &result {
                    log::warn!("{} connect rejected: {}", self.id, e);
                }
                let _ = reply.send(result);
            }
            Command::Read { kind, timeout, tag } => self.enqueue_read(kind, timeout, tag),
            Command::Write { data, timeout, tag } => self.enqueue_write(data, timeout, tag),
            Command::StartTls(settings) => self.start_tls(settings),
            Command::Disconnect(mode) => self.disconnect(mode),
        }
    }

    fn configure(&mut self, setting: Setting) {
        match setting {
            Setting::Ipv4Enabled(enabled) => self.options.set_ipv4_enabled(enabled),
            Setting::Ipv6Enabled(enabled) => self.options.set_ipv6_enabled(enabled),
            Setting::PreferIpv4 => self.options.set_prefer_ipv4(),
            Setting::PreferIpv6 => self.options.set_prefer_ipv6(),
            Setting::AllowHalfDuplex(allowed) => {
                self.options.set(Options::ALLOW_HALF_DUPLEX, allowed)
            }
            Setting::AlternateAddressDelay(delay) => self.alternate_delay = delay,
        }
    }

    fn next_packet_id(&mut self) -> u64 {
        self.next_packet_id += 1;
        self.next_packet_id
    }

    fn enqueue_read(&mut self, kind: ReadKind, timeout: Option<Duration>, tag: Tag) {
        if self.flags.contains(SocketFlags::FORBID_IO) {
            log::debug!("{} read (tag {}) dropped, I/O is forbidden", self.id, tag);
            return;
        }
        let id = self.next_packet_id();
        self.read_queue
            .push_back(ReadItem::Data(ReadPacket::new(id, kind, timeout, tag)));
    }

    fn enqueue_write(&mut self, data: Vec<u8>, timeout: Option<Duration>, tag: Tag) {
        if self.flags.contains(SocketFlags::FORBID_IO) {
            log::debug!("{} write (tag {}) dropped, I/O is forbidden", self.id, tag);
            return;
        }
        let id = self.next_packet_id();
        self.write_queue
            .push_back(WriteItem::Data(WritePacket::new(id, data, timeout, tag)));
    }

    fn start_tls(&mut self, settings: TlsSettings) {
        if self
            .flags
            .intersects(SocketFlags::FORBID_IO | SocketFlags::QUEUED_TLS)
        {
            log::debug!("{} start_tls ignored", self.id);
            return;
        }
        self.flags.insert(SocketFlags::QUEUED_TLS);
        self.tls_settings = Some(settings);
        self.read_queue.push_back(ReadItem::StartTls);
        self.write_queue.push_back(WriteItem::StartTls);
    }

    fn disconnect(&mut self, mode: DisconnectMode) {
        if !self.flags.contains(SocketFlags::STARTED) {
            log::debug!("{} disconnect ignored, socket was never started", self.id);
            return;
        }
        match mode {
            DisconnectMode::Now => self.close(None),
            DisconnectMode::AfterReads => self
                .flags
                .insert(SocketFlags::FORBID_IO | SocketFlags::DISCONNECT_AFTER_READS),
            DisconnectMode::AfterWrites => self
                .flags
                .insert(SocketFlags::FORBID_IO | SocketFlags::DISCONNECT_AFTER_WRITES),
            DisconnectMode::AfterReadsAndWrites => self.flags.insert(
                SocketFlags::FORBID_IO
                    | SocketFlags::DISCONNECT_AFTER_READS
                    | SocketFlags::DISCONNECT_AFTER_WRITES,
            ),
        }
    }

    // ========================================================================
    // Connecting
    // ========================================================================

    fn connect(&mut self, target: ConnectTarget, timeout: Option<Duration>) -> Result<()> {
        if self.delegate.is_none() {
            return Err(Error::BadConfig(
                "attempting to connect without a delegate".into(),
            ));
        }
        if self.flags.contains(SocketFlags::CLOSED) {
            return Err(Error::BadConfig("socket is closed".into()));
        }
        if self.flags.contains(SocketFlags::STARTED) {
            return Err(Error::BadConfig(
                "attempting to connect while connecting or connected".into(),
            ));
        }
        if self.options.both_disabled() {
            return Err(Error::BadConfig(
                "both IPv4 and IPv6 have been disabled".into(),
            ));
        }

        let (host, port, interface, address) = match target {
            ConnectTarget::Host {
                host,
                port,
                interface,
            } => (host, port, interface, None),
            ConnectTarget::Address(addr) => (addr.ip().to_string(), addr.port(), None, Some(addr)),
        };

        if host.is_empty() {
            return Err(Error::BadParam("host must not be empty".into()));
        }

        let interface = match interface {
            Some(descriptor) => Some(self.resolve_local(&descriptor)?),
            None => None,
        };

        if let Some(addr) = address {
            let family = Family::of(&addr);
            let enabled = match family {
                Family::V4 => self.options.ipv4_enabled(),
                Family::V6 => self.options.ipv6_enabled(),
            };
            if !enabled {
                return Err(Error::BadConfig(format!(
                    "{} is disabled, cannot connect to {}",
                    family, addr
                )));
            }
        }

        self.flags
            .insert(SocketFlags::STARTED | SocketFlags::CONNECTING);
        self.host = Some(host.clone());
        self.interface = interface;
        self.connect_timer.start(timeout);

        match address {
            Some(addr) => {
                log::debug!("{} connecting to {}", self.id, addr);
                self.begin_race(ResolvedAddresses::from_addrs([addr]));
            }
            None => {
                log::debug!("{} resolving {}:{}", self.id, host, port);
                let events = self.events_tx.clone();
                let stamp = self.index;
                tokio::spawn(async move {
                    let result = duo_resolve::lookup_host(&host, port).await;
                    let _ = events.send(Event::Resolved { stamp, result });
                });
            }
        }
        Ok(())
    }

    /// Resolve a local interface descriptor, keeping enabled families only
    fn resolve_local(&self, descriptor: &str) -> Result<InterfaceAddresses> {
        let mut local = duo_resolve::resolve_interface(descriptor, 0)
            .map_err(|e| Error::BadParam(format!("unknown interface {}: {}", descriptor, e)))?;
        if !self.options.ipv4_enabled() {
            local.v4 = None;
        }
        if !self.options.ipv6_enabled() {
            local.v6 = None;
        }
        if local.is_empty() {
            return Err(Error::BadParam(format!(
                "interface {} has no address in an enabled family",
                descriptor
            )));
        }
        Ok(local)
    }

    fn begin_race(&mut self, addrs: ResolvedAddresses) {
        let local = self.interface.clone().unwrap_or_default();
        let restricted = self.interface.is_some();

        let v4 = addrs
            .first_v4()
            .filter(|_| self.options.ipv4_enabled())
            .filter(|_| !restricted || local.v4.is_some())
            .map(SocketAddr::V4);
        let v6 = addrs
            .first_v6()
            .filter(|_| self.options.ipv6_enabled())
            .filter(|_| !restricted || local.v6.is_some())
            .map(SocketAddr::V6);

        let (first, second) = if self.options.contains(Options::PREFER_IPV6) {
            (v6, v4)
        } else {
            (v4, v6)
        };

        let (preferred, alternate) = match (first, second) {
            (Some(first), second) => (first, second),
            (None, Some(second)) => (second, None),
            (None, None) => {
                self.close(Some(Error::BadConfig(format!(
                    "no resolved address is usable with {}",
                    self.options
                ))));
                return;
            }
        };

        // recorded first so an immediate failure of the preferred family
        // falls through to the alternate
        self.alternate = alternate;
        self.start_attempt(preferred);
        if self.flags.contains(SocketFlags::CLOSED) {
            return;
        }

        if self.alternate.is_some() {
            let events = self.events_tx.clone();
            let stamp = self.index;
            let delay = self.alternate_delay;
            self.alternate_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(Event::AlternateDue { stamp });
            }));
        }
    }

    fn start_attempt(&mut self, addr: SocketAddr) {
        let family = Family::of(&addr);
        let local = self.interface.as_ref().and_then(|i| match family {
            Family::V4 => i.v4.map(SocketAddr::V4),
            Family::V6 => i.v6.map(SocketAddr::V6),
        });

        let sock = match socket::tcp_socket(family, local) {
            Ok(sock) => sock,
            Err(e) => {
                self.attempt_failed(family, e);
                return;
            }
        };

        log::debug!("{} trying {} ({})", self.id, addr, family);
        let events = self.events_tx.clone();
        let stamp = self.index;
        let attempt = tokio::spawn(async move {
            let result = socket::connect_tcp(sock, addr).await;
            let _ = events.send(Event::Attempt {
                stamp,
                family,
                result,
            });
        });
        self.attempts.push((family, attempt));
    }

    fn start_alternate(&mut self) {
        if let Some(timer) = self.alternate_timer.take() {
            timer.abort();
        }
        if let Some(addr) = self.alternate.take() {
            self.start_attempt(addr);
        }
    }

    fn attempt_failed(&mut self, family: Family, error: io::Error) {
        log::debug!("{} {} attempt failed: {}", self.id, family, error);

        if self.alternate.is_some() {
            self.start_alternate();
            return;
        }
        if self.attempts.is_empty() {
            self.close(Some(error.into()));
        }
    }

    fn connected(&mut self, stream: TcpStream) {
        for (_, attempt) in self.attempts.drain(..) {
            attempt.abort();
        }
        if let Some(timer) = self.alternate_timer.take() {
            timer.abort();
        }
        self.alternate = None;
        self.connect_timer.cancel();

        self.local_addr = stream.local_addr().ok();
        self.peer_addr = stream.peer_addr().ok();
        self.stream = Some(stream);
        self.flags.remove(SocketFlags::CONNECTING);
        self.flags.insert(SocketFlags::CONNECTED);

        let Some(peer) = self.peer_addr else {
            self.close(Some(Error::Other("connected socket has no peer".into())));
            return;
        };
        log::info!("{} connected to {}", self.id, peer);

        let host = peer.ip().to_string();
        let port = peer.port();
        self.notify(move |d, sock| async move { d.did_connect(&sock, host, port).await });
    }

    // ========================================================================
    // Events
    // ========================================================================

    fn handle_event(&mut self, event: Event) {
        if !self.index.is_current(event.stamp()) {
            log::trace!("{} dropping stale event from {}", self.id, event.stamp());
            return;
        }

        match event {
            Event::Resolved { result, .. } => {
                if !self.flags.contains(SocketFlags::CONNECTING) {
                    return;
                }
                match result {
                    Ok(addrs) => self.begin_race(addrs),
                    Err(e) => {
                        log::warn!("{} lookup failed: {}", self.id, e);
                        self.close(Some(e.into()));
                    }
                }
            }
            Event::Attempt { family, result, .. } => {
                self.attempts.retain(|(f, _)| *f != family);
                if !self.flags.contains(SocketFlags::CONNECTING) {
                    return;
                }
                match result {
                    Ok(stream) => self.connected(stream),
                    Err(e) => self.attempt_failed(family, e),
                }
            }
            Event::AlternateDue { .. } => {
                if self.flags.contains(SocketFlags::CONNECTING) {
                    log::debug!("{} alternate address delay elapsed", self.id);
                    self.alternate_timer = None;
                    self.start_alternate();
                }
            }
            Event::ConnectExtension { extension, .. } => {
                if !self.flags.contains(SocketFlags::CONNECTING) {
                    return;
                }
                if extension > Duration::ZERO {
                    log::debug!("{} connect timeout extended by {:?}", self.id, extension);
                    self.connect_timer.extend(extension);
                } else {
                    self.close(Some(Error::ConnectTimeout));
                }
            }
            Event::ReadExtension {
                packet, extension, ..
            } => {
                if self.current_read.as_ref().map(|p| p.id) != Some(packet) {
                    return;
                }
                if extension > Duration::ZERO {
                    self.read_timer.extend(extension);
                    self.flags.remove(SocketFlags::READS_PAUSED);
                } else {
                    self.close(Some(Error::ReadTimeout));
                }
            }
            Event::WriteExtension {
                packet, extension, ..
            } => {
                if self.current_write.as_ref().map(|p| p.id) != Some(packet) {
                    return;
                }
                if extension > Duration::ZERO {
                    self.write_timer.extend(extension);
                    self.flags.remove(SocketFlags::WRITES_PAUSED);
                } else {
                    self.close(Some(Error::WriteTimeout));
                }
            }
            Event::TrustDecision { trusted, .. } => self.trust_decided(trusted),
        }
    }

    // ========================================================================
    // Timeouts
    // ========================================================================

    fn on_connect_timeout(&mut self) {
        if !self.flags.contains(SocketFlags::CONNECTING) {
            self.connect_timer.cancel();
            return;
        }
        let elapsed = self.connect_timer.elapsed();
        self.connect_timer.pause();

        let events = self.events_tx.clone();
        let stamp = self.index;
        let asked = self.notify(move |d, sock| async move {
            let extension = d.should_timeout_connect(&sock, elapsed).await;
            let _ = events.send(Event::ConnectExtension { stamp, extension });
        });
        if !asked {
            self.close(Some(Error::ConnectTimeout));
        }
    }

    fn on_read_timeout(&mut self) {
        let Some(packet) = self.current_read.as_ref() else {
            self.read_timer.cancel();
            return;
        };
        let (packet, tag, done) = (packet.id, packet.tag, packet.bytes_done());
        let elapsed = self.read_timer.elapsed();
        self.read_timer.pause();
        self.flags.insert(SocketFlags::READS_PAUSED);

        let events = self.events_tx.clone();
        let stamp = self.index;
        let asked = self.notify(move |d, sock| async move {
            let extension = d.should_timeout_read(&sock, tag, elapsed, done).await;
            let _ = events.send(Event::ReadExtension {
                stamp,
                packet,
                extension,
            });
        });
        if !asked {
            self.close(Some(Error::ReadTimeout));
        }
    }

    fn on_write_timeout(&mut self) {
        let Some(packet) = self.current_write.as_ref() else {
            self.write_timer.cancel();
            return;
        };
        let (packet, tag, done) = (packet.id, packet.tag, packet.written);
        let elapsed = self.write_timer.elapsed();
        self.write_timer.pause();
        self.flags.insert(SocketFlags::WRITES_PAUSED);

        let events = self.events_tx.clone();
        let stamp = self.index;
        let asked = self.notify(move |d, sock| async move {
            let extension = d.should_timeout_write(&sock, tag, elapsed, done).await;
            let _ = events.send(Event::WriteExtension {
                stamp,
                packet,
                extension,
            });
        });
        if !asked {
            self.close(Some(Error::WriteTimeout));
        }
    }

    // ========================================================================
    // Queues
    // ========================================================================

    /// Move both queues forward until neither can progress without I/O
    fn pump(&mut self) {
        while !self.flags.contains(SocketFlags::CLOSED) {
            let read = self.step_reads();
            let write = self.step_writes();
            if !read && !write {
                break;
            }
        }
        self.publish();
        self.flush_outbox();
    }

    fn step_reads(&mut self) -> bool {
        if !self.flags.contains(SocketFlags::CONNECTED) || self.flags.contains(SocketFlags::CLOSED)
        {
            return false;
        }
        if self.current_read.is_some() {
            return self.do_read();
        }
        if self.flags.contains(SocketFlags::STARTING_READ_TLS) {
            return false;
        }

        match self.read_queue.pop_front() {
            Some(ReadItem::StartTls) => {
                self.flags.insert(SocketFlags::STARTING_READ_TLS);
                self.maybe_start_tls();
                true
            }
            Some(ReadItem::Data(packet)) => {
                self.read_timer.start(packet.timeout);
                self.current_read = Some(packet);
                true
            }
            None => {
                if self.flags.contains(SocketFlags::READ_EOF)
                    && self.prebuffer.is_empty()
                    && !self.flags.contains(SocketFlags::READ_STREAM_CLOSED)
                {
                    self.read_stream_finished();
                    return self.flags.contains(SocketFlags::CLOSED);
                }
                if self.flags.contains(SocketFlags::DISCONNECT_AFTER_READS) {
                    let writes_done = self.write_queue.is_empty() && self.current_write.is_none();
                    if !self.flags.contains(SocketFlags::DISCONNECT_AFTER_WRITES) || writes_done {
                        self.close(None);
                        return true;
                    }
                }
                false
            }
        }
    }

    fn step_writes(&mut self) -> bool {
        if !self.flags.contains(SocketFlags::CONNECTED)
            || self.flags.contains(SocketFlags::CLOSED)
            || self.current_write.is_some()
            || self.flags.contains(SocketFlags::STARTING_WRITE_TLS)
        {
            return false;
        }

        match self.write_queue.pop_front() {
            Some(WriteItem::StartTls) => {
                self.flags.insert(SocketFlags::STARTING_WRITE_TLS);
                self.maybe_start_tls();
                true
            }
            Some(WriteItem::Data(packet)) => {
                self.write_timer.start(packet.timeout);
                self.current_write = Some(packet);
                true
            }
            None => {
                if self.flags.contains(SocketFlags::DISCONNECT_AFTER_WRITES) {
                    let reads_done = self.read_queue.is_empty() && self.current_read.is_none();
                    if !self.flags.contains(SocketFlags::DISCONNECT_AFTER_READS) || reads_done {
                        self.close(None);
                        return true;
                    }
                }
                false
            }
        }
    }

    /// Satisfy the current read from buffered bytes; true once it is done
    fn do_read(&mut self) -> bool {
        if self.flags.contains(SocketFlags::READS_PAUSED) {
            return false;
        }
        let Some(packet) = self.current_read.as_mut() else {
            return false;
        };

        match packet.take_from(&mut self.prebuffer) {
            ReadProgress::Complete => {
                self.read_timer.cancel();
                if let Some(packet) = self.current_read.take() {
                    log::trace!(
                        "{} read complete: {} bytes (tag {})",
                        self.id,
                        packet.buffer.len(),
                        packet.tag
                    );
                    let ReadPacket { buffer, tag, .. } = packet;
                    self.notify(move |d, sock| async move { d.did_read(&sock, buffer, tag).await });
                }
                true
            }
            ReadProgress::MaxedOut => {
                self.close(Some(Error::ReadMaxedOut));
                true
            }
            ReadProgress::Incomplete(n) => {
                let tag = packet.tag;
                if n > 0 {
                    self.notify(move |d, sock| async move {
                        d.did_read_partial(&sock, n, tag).await
                    });
                }
                if self.flags.contains(SocketFlags::READ_EOF) && self.prebuffer.is_empty() {
                    self.close(Some(Error::ConnectionClosed));
                    return true;
                }
                false
            }
        }
    }

    fn complete_write(&mut self) {
        self.write_timer.cancel();
        if let Some(packet) = self.current_write.take() {
            log::trace!(
                "{} write complete: {} bytes (tag {})",
                self.id,
                packet.data.len(),
                packet.tag
            );
            let tag = packet.tag;
            self.notify(move |d, sock| async move { d.did_write(&sock, tag).await });
        }
    }

    fn write_progress(&mut self, n: usize, tag: Tag) {
        if n > 0 {
            self.notify(move |d, sock| async move { d.did_write_partial(&sock, n, tag).await });
        }
    }

    // ========================================================================
    // Socket I/O
    // ========================================================================

    fn want_read(&self) -> bool {
        if self.stream.is_none()
            || !self.flags.contains(SocketFlags::CONNECTED)
            || self.flags.intersects(
                SocketFlags::READ_EOF | SocketFlags::READ_STREAM_CLOSED | SocketFlags::CLOSED,
            )
        {
            return false;
        }

        match &self.tls {
            Some(tls) if !tls.is_established() => return !tls.is_awaiting_trust(),
            Some(_) => {}
            // ciphertext must not be read ahead before the session exists
            None if self.flags.contains(SocketFlags::STARTING_READ_TLS) => return false,
            None => {}
        }

        if self.flags.contains(SocketFlags::READS_PAUSED) {
            return false;
        }
        self.current_read.is_some() || self.prebuffer.is_empty()
    }

    fn want_write(&self) -> bool {
        if self.stream.is_none()
            || !self.flags.contains(SocketFlags::CONNECTED)
            || self.flags.contains(SocketFlags::CLOSED)
        {
            return false;
        }

        if let Some(tls) = &self.tls {
            if !tls.is_established() {
                return tls.wants_write();
            }
            if tls.wants_write() {
                return true;
            }
        }
        self.current_write.is_some() && !self.flags.contains(SocketFlags::WRITES_PAUSED)
    }

    fn on_readable(&mut self) {
        match self.tls.as_ref().map(|t| t.is_established()) {
            Some(false) => self.step_handshake(),
            Some(true) => self.read_tls(),
            None => self.read_plain(),
        }
    }

    fn on_writable(&mut self) {
        match self.tls.as_ref().map(|t| t.is_established()) {
            Some(false) => self.step_handshake(),
            Some(true) => self.write_tls(),
            None => self.write_plain(),
        }
    }

    fn read_plain(&mut self) {
        let Some(stream) = self.stream.as_ref() else {
            return;
        };
        match self
            .prebuffer
            .fill_with(self.read_chunk_size, |buf| stream.try_read(buf))
        {
            Ok(0) => self.handle_eof(),
            Ok(n) => log::trace!("{} read {} bytes", self.id, n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
            Err(e) => self.close(Some(e.into())),
        }
    }

    fn write_plain(&mut self) {
        if self.flags.contains(SocketFlags::WRITES_PAUSED) {
            return;
        }
        let (Some(stream), Some(packet)) = (self.stream.as_ref(), self.current_write.as_mut())
        else {
            return;
        };

        match stream.try_write(packet.remaining()) {
            Ok(n) => {
                packet.advance(n);
                let (done, tag) = (packet.is_done(), packet.tag);
                if done {
                    self.complete_write();
                } else {
                    self.write_progress(n, tag);
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
            Err(e) => self.close(Some(e.into())),
        }
    }

    fn handle_eof(&mut self) {
        self.flags.insert(SocketFlags::READ_EOF);
        log::debug!("{} peer closed its side of the stream", self.id);

        let negotiating = self
            .flags
            .intersects(SocketFlags::STARTING_READ_TLS | SocketFlags::STARTING_WRITE_TLS)
            || self.tls.as_ref().is_some_and(|t| !t.is_established());
        if negotiating {
            self.close(Some(Error::Tls(TlsError::ClosedAbort)));
        }
        // everything else is settled by the read queue in pump()
    }

    /// EOF reached with no read waiting and nothing buffered
    fn read_stream_finished(&mut self) {
        if self.options.contains(Options::ALLOW_HALF_DUPLEX) {
            self.flags.insert(SocketFlags::READ_STREAM_CLOSED);
            log::debug!("{} read stream closed, writes continue", self.id);
            self.notify(|d, sock| async move { d.did_close_read_stream(&sock).await });
        } else {
            self.close(None);
        }
    }

    // ========================================================================
    // TLS
    // ========================================================================

    fn maybe_start_tls(&mut self) {
        if !self
            .flags
            .contains(SocketFlags::STARTING_READ_TLS | SocketFlags::STARTING_WRITE_TLS)
            || self.tls.is_some()
        {
            return;
        }
        let Some(settings) = self.tls_settings.take() else {
            return;
        };

        log::debug!(
            "{} starting TLS as {}",
            self.id,
            if settings.is_server() { "server" } else { "client" }
        );

        let mut context = match SecurityContext::new(&settings, self.host.as_deref()) {
            Ok(context) => context,
            Err(e) => {
                self.close(Some(e.into()));
                return;
            }
        };

        // bytes read ahead before the marker were already ciphertext
        if !self.prebuffer.is_empty() {
            let early = self.prebuffer.readable().to_vec();
            self.prebuffer.reset();
            if let Err(e) = context.feed(&early) {
                self.close(Some(e.into()));
                return;
            }
        }

        self.tls = Some(context);
        self.step_handshake();
    }

    fn step_handshake(&mut self) {
        let (Some(stream), Some(tls)) = (self.stream.as_ref(), self.tls.as_mut()) else {
            return;
        };

        match tls.handshake(&mut StreamIo(stream)) {
            Ok(HandshakeStatus::WouldBlock) => {}
            Ok(HandshakeStatus::PeerAuthCompleted) => self.request_trust(),
            Ok(HandshakeStatus::Complete) => self.finish_tls(),
            Err(e) => {
                log::warn!("{} TLS handshake failed: {}", self.id, e);
                self.close(Some(e.into()));
            }
        }
    }

    fn request_trust(&mut self) {
        if self.trust_requested {
            return;
        }
        self.trust_requested = true;

        let chain = self
            .tls
            .as_ref()
            .map(|t| t.peer_certificates())
            .unwrap_or_default();
        log::debug!(
            "{} asking owner to evaluate a {}-certificate chain",
            self.id,
            chain.len()
        );

        let (completion, decision) = TrustCompletion::new();
        let events = self.events_tx.clone();
        let stamp = self.index;
        tokio::spawn(async move {
            let trusted = decision.await.unwrap_or(false);
            let _ = events.send(Event::TrustDecision { stamp, trusted });
        });

        // without a delegate the completion is dropped, which rejects
        self.notify(move |d, sock| async move {
            d.did_receive_trust(&sock, chain, completion).await
        });
    }

    fn trust_decided(&mut self, trusted: bool) {
        let Some(tls) = self.tls.as_mut() else {
            return;
        };
        if !tls.is_awaiting_trust() {
            return;
        }

        if trusted {
            match tls.approve_peer() {
                Ok(()) => self.finish_tls(),
                Err(e) => self.close(Some(e.into())),
            }
        } else {
            log::warn!("{} peer certificate rejected by owner", self.id);
            let error = tls.reject_peer();
            if let Some(stream) = self.stream.as_ref() {
                let _ = tls.flush(&mut StreamIo(stream));
            }
            self.close(Some(error.into()));
        }
    }

    fn finish_tls(&mut self) {
        self.flags
            .remove(SocketFlags::STARTING_READ_TLS | SocketFlags::STARTING_WRITE_TLS);
        self.flags.insert(SocketFlags::SECURE);

        if let Some(tls) = &self.tls {
            log::info!(
                "{} secured with {} ({})",
                self.id,
                tls.protocol_version()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "unknown version".into()),
                tls.cipher_suite().unwrap_or_default()
            );
        }
        self.notify(|d, sock| async move { d.did_secure(&sock).await });

        match self.drain_plaintext() {
            Ok(true) => self.handle_eof(),
            Ok(false) => {}
            Err(e) => self.close(Some(e.into())),
        }
    }

    /// Move decrypted bytes into the prebuffer; true once the peer closed
    fn drain_plaintext(&mut self) -> std::result::Result<bool, TlsError> {
        let Some(tls) = self.tls.as_mut() else {
            return Ok(false);
        };
        let mut plain = Vec::new();
        let read = tls.read_plaintext(&mut plain)?;
        if !plain.is_empty() {
            self.prebuffer.extend_from_slice(&plain);
        }
        Ok(read.closed)
    }

    fn read_tls(&mut self) {
        let (Some(stream), Some(tls)) = (self.stream.as_ref(), self.tls.as_mut()) else {
            return;
        };
        let mut io = StreamIo(stream);

        let eof = match tls.read_ciphertext(&mut io) {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                return;
            }
            Err(e) => {
                self.close(Some(e.into()));
                return;
            }
        };

        if !eof {
            if let Err(e) = tls.process(&mut io) {
                log::warn!("{} TLS record error: {}", self.id, e);
                self.close(Some(e.into()));
                return;
            }
        }

        match self.drain_plaintext() {
            Ok(closed) if closed || eof => self.handle_eof(),
            Ok(_) => {}
            Err(e) => self.close(Some(e.into())),
        }
    }

    fn write_tls(&mut self) {
        let (Some(stream), Some(tls)) = (self.stream.as_ref(), self.tls.as_mut()) else {
            return;
        };
        let mut io = StreamIo(stream);

        let mut accepted = 0;
        if !self.flags.contains(SocketFlags::WRITES_PAUSED) {
            if let Some(packet) = self.current_write.as_mut() {
                match tls.write_plaintext(packet.remaining()) {
                    Ok(n) => {
                        packet.advance(n);
                        accepted = n;
                    }
                    Err(e) => {
                        self.close(Some(e.into()));
                        return;
                    }
                }
            }
        }

        if let Err(e) = tls.flush(&mut io) {
            self.close(Some(e.into()));
            return;
        }
        let flushed = !tls.wants_write();

        let Some(packet) = self.current_write.as_ref() else {
            return;
        };
        let (done, tag) = (packet.is_done(), packet.tag);
        if done && flushed {
            self.complete_write();
        } else {
            self.write_progress(accepted, tag);
        }
    }

    // ========================================================================
    // Teardown and notification
    // ========================================================================

    /// Tear everything down once; later calls do nothing
    fn close(&mut self, error: Option<Error>) {
        if self.flags.contains(SocketFlags::CLOSED) {
            return;
        }
        self.index.advance();

        for (_, attempt) in self.attempts.drain(..) {
            attempt.abort();
        }
        if let Some(timer) = self.alternate_timer.take() {
            timer.abort();
        }
        self.alternate = None;

        self.connect_timer.cancel();
        self.read_timer.cancel();
        self.write_timer.cancel();

        self.read_queue.clear();
        self.write_queue.clear();
        self.current_read = None;
        self.current_write = None;

        if self.flags.contains(SocketFlags::SECURE) {
            if let (Some(tls), Some(stream)) = (self.tls.as_mut(), self.stream.as_ref()) {
                tls.close(&mut StreamIo(stream));
            }
        }
        self.tls = None;
        self.tls_settings = None;
        self.stream = None;
        self.prebuffer.reset();
        self.local_addr = None;
        self.peer_addr = None;

        let was_started = self.flags.contains(SocketFlags::STARTED);
        self.flags = SocketFlags::CLOSED;

        match &error {
            Some(e) => log::warn!("{} closed: {}", self.id, e),
            None => log::info!("{} closed", self.id),
        }

        if was_started {
            self.notify(move |d, sock| async move { d.did_disconnect(&sock, error).await });
        }
    }

    /// Queue a delegate callback; false when nobody is listening
    ///
    /// Callbacks are dispatched after the next `publish()`, so the owner
    /// always observes state at least as new as the event.
    fn notify<F, Fut>(&mut self, callback: F) -> bool
    where
        F: FnOnce(Arc<dyn TcpSocketDelegate>, TcpSocket) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(delegate) = self.delegate.clone() else {
            return false;
        };
        let Some(shared) = self.handle.upgrade() else {
            return false;
        };
        self.outbox
            .push(Box::pin(callback(delegate, TcpSocket::from_shared(shared))));
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

    fn publish(&mut self) {
        let secure = self.tls.as_ref().filter(|t| t.is_established());
        let info = TcpInfo {
            flags: self.flags,
            options: self.options,
            local_addr: self.local_addr,
            peer_addr: self.peer_addr,
            tls_version: secure.and_then(|t| t.protocol_version()),
            alpn: secure.and_then(|t| t.alpn_protocol()),
            cipher_suite: secure.and_then(|t| t.cipher_suite()),
            pending_reads: self
                .read_queue
                .iter()
                .filter(|i| matches!(i, ReadItem::Data(_)))
                .count()
                + usize::from(self.current_read.is_some()),
            pending_writes: self
                .write_queue
                .iter()
                .filter(|i| matches!(i, WriteItem::Data(_)))
                .count()
                + usize::from(self.current_write.is_some()),
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

async fn readable(stream: Option<&TcpStream>) -> io::Result<()> {
    match stream {
        Some(stream) => stream.readable().await,
        None => std::future::pending().await,
    }
}

async fn writable(stream: Option<&TcpStream>) -> io::Result<()> {
    match stream {
        Some(stream) => stream.writable().await,
        None => std::future::pending().await,
    }
}
