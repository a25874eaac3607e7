//! TLS session state machine
//!
//! `SecurityContext` steps a backend through the handshake over whatever
//! non-blocking transport the caller passes in, and reports one of three
//! statuses. In manual-trust mode a finished handshake stops at
//! `PeerAuthCompleted` until the owner approves or rejects the chain.

use std::io::{self, ErrorKind, Read, Write};

use rustls_pki_types::CertificateDer;

use crate::backend::{RecordState, RustlsBackend, TlsBackend};
use crate::error::{Result, TlsError};
use crate::settings::{TlsSettings, TlsVersion};

const PLAINTEXT_CHUNK: usize = 16 * 1024;

/// Outcome of one handshake step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// More transport I/O is needed; check `wants_write` for the direction
    WouldBlock,
    /// The chain checked out structurally; the owner must decide on trust
    PeerAuthCompleted,
    /// The session is established
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Handshaking,
    AwaitingTrust,
    Established,
    Failed,
}

/// Plaintext drained from the session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaintextRead {
    /// Bytes appended to the output
    pub bytes: usize,
    /// The peer has closed its side of the session
    pub closed: bool,
}

/// A TLS session bound to one socket
pub struct SecurityContext {
    backend: Box<dyn TlsBackend>,
    manual_trust: bool,
    phase: Phase,
}

impl std::fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityContext")
            .field("manual_trust", &self.manual_trust)
            .field("phase", &self.phase)
            .finish()
    }
}

impl SecurityContext {
    /// Create a rustls-backed context
    ///
    /// `server_name` is used for client verification unless the settings
    /// carry a peer-name override.
    pub fn new(settings: &TlsSettings, server_name: Option<&str>) -> Result<Self> {
        let name = settings.peer_name().or(server_name);
        let backend = RustlsBackend::new(settings, name)?;
        Ok(Self::with_backend(Box::new(backend), settings.manual_trust()))
    }

    /// Wrap a custom backend
    pub fn with_backend(backend: Box<dyn TlsBackend>, manual_trust: bool) -> Self {
        Self {
            backend,
            manual_trust,
            phase: Phase::Handshaking,
        }
    }

    /// Advance the handshake as far as the transport allows
    pub fn handshake<IO: Read + Write>(&mut self, io: &mut IO) -> Result<HandshakeStatus> {
        match self.phase {
            Phase::Established => return Ok(HandshakeStatus::Complete),
            Phase::Failed => return Err(TlsError::ClosedAbort),
            Phase::AwaitingTrust => {
                self.flush(io)?;
                return Ok(HandshakeStatus::PeerAuthCompleted);
            }
            Phase::Handshaking => {}
        }

        loop {
            if !self.flush(io)? {
                return Ok(HandshakeStatus::WouldBlock);
            }

            if !self.backend.is_handshaking() {
                if self.manual_trust {
                    self.phase = Phase::AwaitingTrust;
                    return Ok(HandshakeStatus::PeerAuthCompleted);
                }
                self.phase = Phase::Established;
                return Ok(HandshakeStatus::Complete);
            }

            match self.backend.read_tls(io) {
                Ok(0) => {
                    self.phase = Phase::Failed;
                    return Err(TlsError::ClosedAbort);
                }
                Ok(_) => {
                    self.process(io)?;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    return Ok(HandshakeStatus::WouldBlock);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    self.phase = Phase::Failed;
                    return Err(e.into());
                }
            }
        }
    }

    /// Accept the peer after `PeerAuthCompleted`
    pub fn approve_peer(&mut self) -> Result<()> {
        if self.phase != Phase::AwaitingTrust {
            return Err(TlsError::Config("no trust decision is pending".into()));
        }
        self.phase = Phase::Established;
        Ok(())
    }

    /// Refuse the peer after `PeerAuthCompleted`
    ///
    /// Returns the error the session failed with.
    pub fn reject_peer(&mut self) -> TlsError {
        self.phase = Phase::Failed;
        self.backend.send_close_notify();
        TlsError::PeerNotTrusted
    }

    /// Check if the handshake (and any trust decision) is done
    pub fn is_established(&self) -> bool {
        self.phase == Phase::Established
    }

    pub fn is_awaiting_trust(&self) -> bool {
        self.phase == Phase::AwaitingTrust
    }

    /// Check if ciphertext is waiting for the transport
    pub fn wants_write(&self) -> bool {
        self.backend.wants_write()
    }

    /// Write pending ciphertext; returns false if the transport is full
    pub fn flush<W: Write>(&mut self, io: &mut W) -> Result<bool> {
        while self.backend.wants_write() {
            match self.backend.write_tls(io) {
                Ok(0) => {
                    return Err(TlsError::Io("transport accepted no data".into()));
                }
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// Read ciphertext from the transport; `Ok(0)` is end of stream
    pub fn read_ciphertext<R: Read>(&mut self, io: &mut R) -> io::Result<usize> {
        self.backend.read_tls(io)
    }

    /// Feed ciphertext that was read before the session existed
    pub fn feed(&mut self, mut ciphertext: &[u8]) -> Result<()> {
        while !ciphertext.is_empty() {
            let n = self.backend.read_tls(&mut ciphertext)?;
            if n == 0 {
                break;
            }
            if let Err(e) = self.backend.process_packets() {
                self.phase = Phase::Failed;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Process records received so far
    ///
    /// On failure any alert the backend queued is written best effort.
    pub fn process<W: Write>(&mut self, io: &mut W) -> Result<RecordState> {
        match self.backend.process_packets() {
            Ok(state) => Ok(state),
            Err(e) => {
                let _ = self.backend.write_tls(io);
                self.phase = Phase::Failed;
                Err(e)
            }
        }
    }

    /// Move all decrypted bytes into `out`
    pub fn read_plaintext(&mut self, out: &mut Vec<u8>) -> Result<PlaintextRead> {
        let mut read = PlaintextRead::default();
        let mut chunk = [0u8; PLAINTEXT_CHUNK];

        loop {
            match self.backend.read_plaintext(&mut chunk) {
                Ok(0) => {
                    read.closed = true;
                    break;
                }
                Ok(n) => {
                    out.extend_from_slice(&chunk[..n]);
                    read.bytes += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    log::debug!("TLS peer closed without close_notify");
                    read.closed = true;
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(read)
    }

    /// Queue plaintext for encryption; may accept fewer bytes than given
    pub fn write_plaintext(&mut self, data: &[u8]) -> Result<usize> {
        Ok(self.backend.write_plaintext(data)?)
    }

    /// Send close_notify, best effort
    pub fn close<W: Write>(&mut self, io: &mut W) {
        if self.phase == Phase::Failed {
            return;
        }
        self.backend.send_close_notify();
        let _ = self.flush(io);
        self.phase = Phase::Failed;
    }

    pub fn peer_certificates(&self) -> Vec<CertificateDer<'static>> {
        self.backend.peer_certificates()
    }

    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.backend.alpn_protocol()
    }

    pub fn protocol_version(&self) -> Option<TlsVersion> {
        self.backend.protocol_version()
    }

    pub fn cipher_suite(&self) -> Option<String> {
        self.backend.cipher_suite()
    }
}
