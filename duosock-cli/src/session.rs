//! Delegates that turn socket callbacks into terminal output

use std::net::SocketAddr;

use async_trait::async_trait;
use duosock::{
    Error, FilterContext, Tag, TcpSocket, TcpSocketDelegate, TrustCompletion, UdpSocket,
    UdpSocketDelegate,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Tag of the rolling line read
pub const READ_TAG: Tag = 0;

/// Queue the next line read
pub fn read_line(sock: &TcpSocket) -> duosock::Result<()> {
    sock.read_data_to_terminator(b"\n", None, None, READ_TAG)
}

/// What the TCP session loop needs to react to
#[derive(Debug)]
pub enum SessionEvent {
    Connected,
    Secured,
    Data(Vec<u8>),
    Closed(Option<Error>),
}

/// Forwards TCP traffic to the session loop and re-arms the read after every line
pub struct TcpSession {
    events: mpsc::UnboundedSender<SessionEvent>,
    /// Accept any certificate chain after logging it
    trust_all: bool,
}

impl TcpSession {
    pub fn new(trust_all: bool) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events, trust_all }, rx)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl TcpSocketDelegate for TcpSession {
    async fn did_connect(&self, sock: &TcpSocket, host: String, port: u16) {
        info!("Connected to {}:{} from {:?}", host, port, sock.local_address());
        self.emit(SessionEvent::Connected);
    }

    async fn did_read(&self, sock: &TcpSocket, data: Vec<u8>, _tag: Tag) {
        self.emit(SessionEvent::Data(data));
        if let Err(e) = read_line(sock) {
            warn!("Cannot queue the next read: {}", e);
        }
    }

    async fn did_write(&self, _sock: &TcpSocket, tag: Tag) {
        debug!("Line {} sent", tag);
    }

    async fn did_secure(&self, sock: &TcpSocket) {
        let info = sock.info();
        info!(
            "TLS established: {} {}",
            info.tls_version
                .map(|v| v.to_string())
                .unwrap_or_else(|| "unknown".into()),
            info.cipher_suite.unwrap_or_default()
        );
        self.emit(SessionEvent::Secured);
    }

    async fn did_receive_trust(
        &self,
        _sock: &TcpSocket,
        chain: Vec<duosock::CertificateDer<'static>>,
        completion: TrustCompletion,
    ) {
        if self.trust_all {
            warn!("Accepting unverified {}-certificate chain", chain.len());
            completion.approve();
        } else {
            completion.reject();
        }
    }

    async fn did_close_read_stream(&self, _sock: &TcpSocket) {
        info!("Peer finished sending");
    }

    async fn did_disconnect(&self, _sock: &TcpSocket, error: Option<Error>) {
        self.emit(SessionEvent::Closed(error));
    }
}

/// Prints every datagram with its source
pub struct UdpPrinter {
    done: mpsc::UnboundedSender<Option<Error>>,
}

impl UdpPrinter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Option<Error>>) {
        let (done, rx) = mpsc::unbounded_channel();
        (Self { done }, rx)
    }
}

#[async_trait]
impl UdpSocketDelegate for UdpPrinter {
    async fn did_connect(&self, _sock: &UdpSocket, address: SocketAddr) {
        info!("Connected to {}", address);
    }

    async fn did_not_connect(&self, _sock: &UdpSocket, error: Error) {
        warn!("Connect failed: {}", error);
        let _ = self.done.send(Some(error));
    }

    async fn did_send(&self, _sock: &UdpSocket, tag: Tag) {
        debug!("Datagram {} sent", tag);
    }

    async fn did_not_send(&self, _sock: &UdpSocket, tag: Tag, error: Error) {
        warn!("Datagram {} not sent: {}", tag, error);
    }

    async fn did_receive(
        &self,
        _sock: &UdpSocket,
        data: Vec<u8>,
        from: SocketAddr,
        _context: Option<FilterContext>,
    ) {
        println!("[{}] {}", from, String::from_utf8_lossy(&data).trim_end());
    }

    async fn did_close(&self, _sock: &UdpSocket, error: Option<Error>) {
        let _ = self.done.send(error);
    }
}
