//! Owner-facing callbacks and the queue they run on
//!
//! Engines never call their owner inline. Every notification is boxed and
//! handed to a `DelegateQueue`, which runs them one at a time on its own
//! task, so a slow delegate can only hold up other delegate calls, never
//! socket I/O.

use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use duo_tls::CertificateDer;
use tokio::sync::{mpsc, oneshot};

use crate::error::Error;
use crate::tcp::TcpSocket;
use crate::udp::UdpSocket;
use crate::Tag;

/// Opaque value a receive filter attaches to an accepted datagram
pub type FilterContext = Arc<dyn Any + Send + Sync>;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Serial executor for delegate callbacks
///
/// Cloning shares the queue: callbacks from every socket using it run in
/// submission order. The worker task exits once every clone is dropped.
#[derive(Clone)]
pub struct DelegateQueue {
    label: Arc<str>,
    jobs: mpsc::UnboundedSender<Job>,
}

impl DelegateQueue {
    /// Start a queue; must be called inside a Tokio runtime
    pub fn new(label: impl Into<String>) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        let label: Arc<str> = Arc::from(label.into());

        let worker_label = label.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            log::trace!("Delegate queue {} drained", worker_label);
        });

        Self { label, jobs }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Queue a callback behind everything already submitted
    pub fn dispatch<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.jobs.send(Box::pin(job)).is_err() {
            log::debug!("Delegate queue {} is gone, dropping callback", self.label);
        }
    }
}

impl std::fmt::Debug for DelegateQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegateQueue")
            .field("label", &self.label)
            .finish()
    }
}

/// One-shot answer to a manual trust evaluation
///
/// Dropping it without an answer rejects the peer.
pub struct TrustCompletion {
    reply: Option<oneshot::Sender<bool>>,
}

impl TrustCompletion {
    pub(crate) fn new() -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (Self { reply: Some(tx) }, rx)
    }

    /// Trust the chain and let the handshake finish
    pub fn approve(mut self) {
        self.answer(true);
    }

    /// Refuse the chain; the socket closes with a TLS error
    pub fn reject(mut self) {
        self.answer(false);
    }

    /// Answer with a boolean
    pub fn complete(mut self, trusted: bool) {
        self.answer(trusted);
    }

    fn answer(&mut self, trusted: bool) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(trusted);
        }
    }
}

impl Drop for TrustCompletion {
    fn drop(&mut self) {
        self.answer(false);
    }
}

impl std::fmt::Debug for TrustCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustCompletion")
            .field("answered", &self.reply.is_none())
            .finish()
    }
}

/// Callbacks from a TCP socket
///
/// Every method has a default; implement the ones you care about. Timeout
/// hooks return the extra time to grant, `Duration::ZERO` fails the
/// operation.
#[async_trait]
pub trait TcpSocketDelegate: Send + Sync + 'static {
    /// A family won the connect race
    async fn did_connect(&self, _sock: &TcpSocket, _host: String, _port: u16) {}

    /// A read packet completed
    async fn did_read(&self, _sock: &TcpSocket, _data: Vec<u8>, _tag: Tag) {}

    /// A read packet made progress without completing
    async fn did_read_partial(&self, _sock: &TcpSocket, _length: usize, _tag: Tag) {}

    /// A write packet was fully transmitted
    async fn did_write(&self, _sock: &TcpSocket, _tag: Tag) {}

    /// A write packet made progress without completing
    async fn did_write_partial(&self, _sock: &TcpSocket, _length: usize, _tag: Tag) {}

    async fn should_timeout_connect(&self, _sock: &TcpSocket, _elapsed: Duration) -> Duration {
        Duration::ZERO
    }

    async fn should_timeout_read(
        &self,
        _sock: &TcpSocket,
        _tag: Tag,
        _elapsed: Duration,
        _bytes_done: usize,
    ) -> Duration {
        Duration::ZERO
    }

    async fn should_timeout_write(
        &self,
        _sock: &TcpSocket,
        _tag: Tag,
        _elapsed: Duration,
        _bytes_done: usize,
    ) -> Duration {
        Duration::ZERO
    }

    /// TLS negotiation finished
    async fn did_secure(&self, _sock: &TcpSocket) {}

    /// Manual trust: decide on the peer's chain (end entity first)
    async fn did_receive_trust(
        &self,
        _sock: &TcpSocket,
        _chain: Vec<CertificateDer<'static>>,
        completion: TrustCompletion,
    ) {
        completion.reject();
    }

    /// Half-duplex: the peer finished sending, writes still work
    async fn did_close_read_stream(&self, _sock: &TcpSocket) {}

    /// The socket closed; `None` for a requested or clean close
    async fn did_disconnect(&self, _sock: &TcpSocket, _error: Option<Error>) {}
}

/// Callbacks from a UDP socket
#[async_trait]
pub trait UdpSocketDelegate: Send + Sync + 'static {
    async fn did_connect(&self, _sock: &UdpSocket, _address: SocketAddr) {}

    async fn did_not_connect(&self, _sock: &UdpSocket, _error: Error) {}

    /// The datagram left (or a send filter dropped it)
    async fn did_send(&self, _sock: &UdpSocket, _tag: Tag) {}

    async fn did_not_send(&self, _sock: &UdpSocket, _tag: Tag, _error: Error) {}

    async fn did_receive(
        &self,
        _sock: &UdpSocket,
        _data: Vec<u8>,
        _from: SocketAddr,
        _context: Option<FilterContext>,
    ) {
    }

    async fn did_close(&self, _sock: &UdpSocket, _error: Option<Error>) {}
}

/// Delegate that logs every TCP event
pub struct LoggingTcpDelegate;

#[async_trait]
impl TcpSocketDelegate for LoggingTcpDelegate {
    async fn did_connect(&self, sock: &TcpSocket, host: String, port: u16) {
        log::info!("{} connected to {}:{}", sock.id(), host, port);
    }

    async fn did_read(&self, sock: &TcpSocket, data: Vec<u8>, tag: Tag) {
        log::info!("{} read {} bytes (tag {})", sock.id(), data.len(), tag);
    }

    async fn did_read_partial(&self, sock: &TcpSocket, length: usize, tag: Tag) {
        log::debug!("{} read {} more bytes (tag {})", sock.id(), length, tag);
    }

    async fn did_write(&self, sock: &TcpSocket, tag: Tag) {
        log::info!("{} write complete (tag {})", sock.id(), tag);
    }

    async fn did_write_partial(&self, sock: &TcpSocket, length: usize, tag: Tag) {
        log::debug!("{} wrote {} more bytes (tag {})", sock.id(), length, tag);
    }

    async fn did_secure(&self, sock: &TcpSocket) {
        let info = sock.info();
        log::info!(
            "{} secured ({})",
            sock.id(),
            info.tls_version
                .map(|v| v.to_string())
                .unwrap_or_else(|| "unknown version".into())
        );
    }

    async fn did_close_read_stream(&self, sock: &TcpSocket) {
        log::info!("{} read stream closed by peer", sock.id());
    }

    async fn did_disconnect(&self, sock: &TcpSocket, error: Option<Error>) {
        match error {
            Some(e) => log::warn!("{} disconnected: {}", sock.id(), e),
            None => log::info!("{} disconnected", sock.id()),
        }
    }
}

/// Delegate that logs every UDP event
pub struct LoggingUdpDelegate;

#[async_trait]
impl UdpSocketDelegate for LoggingUdpDelegate {
    async fn did_connect(&self, sock: &UdpSocket, address: SocketAddr) {
        log::info!("{} connected to {}", sock.id(), address);
    }

    async fn did_not_connect(&self, sock: &UdpSocket, error: Error) {
        log::warn!("{} connect failed: {}", sock.id(), error);
    }

    async fn did_send(&self, sock: &UdpSocket, tag: Tag) {
        log::debug!("{} sent datagram (tag {})", sock.id(), tag);
    }

    async fn did_not_send(&self, sock: &UdpSocket, tag: Tag, error: Error) {
        log::warn!("{} send failed (tag {}): {}", sock.id(), tag, error);
    }

    async fn did_receive(
        &self,
        sock: &UdpSocket,
        data: Vec<u8>,
        from: SocketAddr,
        _context: Option<FilterContext>,
    ) {
        log::info!("{} received {} bytes from {}", sock.id(), data.len(), from);
    }

    async fn did_close(&self, sock: &UdpSocket, error: Option<Error>) {
        match error {
            Some(e) => log::warn!("{} closed: {}", sock.id(), e),
            None => log::info!("{} closed", sock.id()),
        }
    }
}
