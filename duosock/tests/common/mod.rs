//! Delegates that forward every callback to a channel, so tests can assert
//! on the exact sequence of events a socket produced.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use duosock::{
    Error, FilterContext, Tag, TcpSocket, TcpSocketDelegate, TrustCompletion, UdpSocket,
    UdpSocketDelegate,
};
use rustls::pki_types::CertificateDer;
use tokio::sync::mpsc;

/// Give up on an expected event after this long
pub const EVENT_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum TcpEvent {
    Connected(String, u16),
    Read(Vec<u8>, Tag),
    Wrote(Tag),
    Secured,
    Trust(usize),
    /// The trust answer was handed to the test
    TrustDeferred(TrustCompletion),
    ReadStreamClosed,
    Disconnected(Option<Error>),
}

/// How a recording delegate answers trust requests
#[derive(Debug, Clone, Copy)]
pub enum TrustAnswer {
    Approve,
    Reject,
    /// Pass the completion on as `TcpEvent::TrustDeferred`
    Defer,
}

pub struct TcpRecorder {
    events: mpsc::UnboundedSender<TcpEvent>,
    /// Timeout extensions still to grant, per operation
    connect_extensions: AtomicU32,
    read_extensions: AtomicU32,
    write_extensions: AtomicU32,
    extension: Duration,
    trust: TrustAnswer,
}

impl TcpRecorder {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TcpEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                events,
                connect_extensions: AtomicU32::new(0),
                read_extensions: AtomicU32::new(0),
                write_extensions: AtomicU32::new(0),
                extension: Duration::ZERO,
                trust: TrustAnswer::Reject,
            },
            rx,
        )
    }

    pub fn with_connect_extensions(mut self, count: u32, extension: Duration) -> Self {
        self.connect_extensions = AtomicU32::new(count);
        self.extension = extension;
        self
    }

    pub fn with_read_extensions(mut self, count: u32, extension: Duration) -> Self {
        self.read_extensions = AtomicU32::new(count);
        self.extension = extension;
        self
    }

    pub fn with_write_extensions(mut self, count: u32, extension: Duration) -> Self {
        self.write_extensions = AtomicU32::new(count);
        self.extension = extension;
        self
    }

    pub fn with_trust(mut self, trust: TrustAnswer) -> Self {
        self.trust = trust;
        self
    }

    fn emit(&self, event: TcpEvent) {
        let _ = self.events.send(event);
    }

    fn grant(&self, remaining: &AtomicU32) -> Duration {
        let granted = remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if granted {
            self.extension
        } else {
            Duration::ZERO
        }
    }
}

#[async_trait]
impl TcpSocketDelegate for TcpRecorder {
    async fn did_connect(&self, _sock: &TcpSocket, host: String, port: u16) {
        self.emit(TcpEvent::Connected(host, port));
    }

    async fn did_read(&self, _sock: &TcpSocket, data: Vec<u8>, tag: Tag) {
        self.emit(TcpEvent::Read(data, tag));
    }

    async fn did_write(&self, _sock: &TcpSocket, tag: Tag) {
        self.emit(TcpEvent::Wrote(tag));
    }

    async fn should_timeout_connect(&self, _sock: &TcpSocket, _elapsed: Duration) -> Duration {
        self.grant(&self.connect_extensions)
    }

    async fn should_timeout_read(
        &self,
        _sock: &TcpSocket,
        _tag: Tag,
        _elapsed: Duration,
        _bytes_done: usize,
    ) -> Duration {
        self.grant(&self.read_extensions)
    }

    async fn should_timeout_write(
        &self,
        _sock: &TcpSocket,
        _tag: Tag,
        _elapsed: Duration,
        _bytes_done: usize,
    ) -> Duration {
        self.grant(&self.write_extensions)
    }

    async fn did_secure(&self, _sock: &TcpSocket) {
        self.emit(TcpEvent::Secured);
    }

    async fn did_receive_trust(
        &self,
        _sock: &TcpSocket,
        chain: Vec<CertificateDer<'static>>,
        completion: TrustCompletion,
    ) {
        self.emit(TcpEvent::Trust(chain.len()));
        match self.trust {
            TrustAnswer::Approve => completion.approve(),
            TrustAnswer::Reject => completion.reject(),
            TrustAnswer::Defer => self.emit(TcpEvent::TrustDeferred(completion)),
        }
    }

    async fn did_close_read_stream(&self, _sock: &TcpSocket) {
        self.emit(TcpEvent::ReadStreamClosed);
    }

    async fn did_disconnect(&self, _sock: &TcpSocket, error: Option<Error>) {
        self.emit(TcpEvent::Disconnected(error));
    }
}

#[derive(Debug)]
pub enum UdpEvent {
    Connected(SocketAddr),
    NotConnected(Error),
    Sent(Tag),
    NotSent(Tag, Error),
    Received(Vec<u8>, SocketAddr, Option<FilterContext>),
    Closed(Option<Error>),
}

pub struct UdpRecorder {
    events: mpsc::UnboundedSender<UdpEvent>,
}

impl UdpRecorder {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UdpEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }

    pub fn shared() -> (Arc<Self>, mpsc::UnboundedReceiver<UdpEvent>) {
        let (recorder, rx) = Self::new();
        (Arc::new(recorder), rx)
    }

    fn emit(&self, event: UdpEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl UdpSocketDelegate for UdpRecorder {
    async fn did_connect(&self, _sock: &UdpSocket, address: SocketAddr) {
        self.emit(UdpEvent::Connected(address));
    }

    async fn did_not_connect(&self, _sock: &UdpSocket, error: Error) {
        self.emit(UdpEvent::NotConnected(error));
    }

    async fn did_send(&self, _sock: &UdpSocket, tag: Tag) {
        self.emit(UdpEvent::Sent(tag));
    }

    async fn did_not_send(&self, _sock: &UdpSocket, tag: Tag, error: Error) {
        self.emit(UdpEvent::NotSent(tag, error));
    }

    async fn did_receive(
        &self,
        _sock: &UdpSocket,
        data: Vec<u8>,
        from: SocketAddr,
        context: Option<FilterContext>,
    ) {
        self.emit(UdpEvent::Received(data, from, context));
    }

    async fn did_close(&self, _sock: &UdpSocket, error: Option<Error>) {
        self.emit(UdpEvent::Closed(error));
    }
}

/// Next event, failing the test after `EVENT_WAIT`
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(EVENT_WAIT, rx.recv())
        .await
        .expect("timed out waiting for a socket event")
        .expect("event channel closed")
}

/// Assert nothing arrives for `quiet`
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>, quiet: Duration) {
    if let Ok(Some(event)) = tokio::time::timeout(quiet, rx.recv()).await {
        panic!("unexpected event: {:?}", event);
    }
}

/// Listener whose accept queue is full, so further connects hang in SYN_SENT
///
/// Keep the returned streams alive for as long as the listener must stay
/// saturated. `None` when the host would not let the queue fill up.
pub async fn saturated_listener(
    addr: SocketAddr,
) -> Option<(socket2::Socket, SocketAddr, Vec<std::net::TcpStream>)> {
    use socket2::{Domain, Protocol, Socket, Type};

    let listener = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).ok()?;
    if addr.is_ipv6() {
        listener.set_only_v6(true).ok()?;
    }
    listener.bind(&addr.into()).ok()?;
    listener.listen(0).ok()?;
    let addr = listener.local_addr().ok()?.as_socket()?;

    tokio::task::spawn_blocking(move || {
        let mut held = Vec::new();
        for _ in 0..64 {
            match std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(200)) {
                Ok(stream) => held.push(stream),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Some((listener, addr, held));
                }
                Err(_) => return None,
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Check whether the host can open IPv6 loopback sockets
pub fn ipv6_available() -> bool {
    std::net::UdpSocket::bind("[::1]:0").is_ok()
}
