//! Pluggable TLS backends
//!
//! A backend is a sans-io session: ciphertext goes in through `read_tls`,
//! comes out through `write_tls`, and plaintext is exchanged on the other
//! side. The socket engine owns the transport and decides when to move
//! bytes.

use std::io::{self, Read, Write};

use rustls::{ClientConnection, ServerConnection};
use rustls_pki_types::{CertificateDer, ServerName};

use crate::error::{Result, TlsError};
use crate::settings::{TlsSettings, TlsVersion};

/// Result of processing newly received records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordState {
    /// Decrypted bytes ready for `read_plaintext`
    pub plaintext_bytes: usize,
    /// The peer sent close_notify
    pub peer_has_closed: bool,
}

/// A TLS session that does no I/O of its own
pub trait TlsBackend: Send {
    /// Read ciphertext from the transport
    fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize>;

    /// Write pending ciphertext to the transport
    fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize>;

    /// Process received records, advancing the handshake
    fn process_packets(&mut self) -> Result<RecordState>;

    /// Take decrypted application data
    ///
    /// `Ok(0)` means the peer closed cleanly; `WouldBlock` means nothing is
    /// buffered yet.
    fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Hand application data over for encryption
    fn write_plaintext(&mut self, data: &[u8]) -> io::Result<usize>;

    fn wants_read(&self) -> bool;

    fn wants_write(&self) -> bool;

    fn is_handshaking(&self) -> bool;

    /// Certificate chain presented by the peer, end entity first
    fn peer_certificates(&self) -> Vec<CertificateDer<'static>>;

    fn alpn_protocol(&self) -> Option<Vec<u8>>;

    fn protocol_version(&self) -> Option<TlsVersion>;

    /// IANA name of the negotiated cipher suite
    fn cipher_suite(&self) -> Option<String>;

    /// Queue a close_notify alert
    fn send_close_notify(&mut self);
}

enum Session {
    Client(ClientConnection),
    Server(ServerConnection),
}

/// rustls-backed session (ring provider)
pub struct RustlsBackend {
    session: Session,
}

impl RustlsBackend {
    /// Create a session for the role in `settings`
    ///
    /// Clients verify the peer against `server_name`.
    pub fn new(settings: &TlsSettings, server_name: Option<&str>) -> Result<Self> {
        let session = if settings.is_server() {
            let conn = ServerConnection::new(settings.server_config()?)?;
            Session::Server(conn)
        } else {
            let name = server_name
                .ok_or_else(|| TlsError::Config("client sessions need a server name".into()))?;
            let name = ServerName::try_from(name.to_string())
                .map_err(|_| TlsError::Config(format!("invalid server name: {}", name)))?;
            let conn = ClientConnection::new(settings.client_config()?, name)?;
            Session::Client(conn)
        };

        Ok(Self { session })
    }
}

impl TlsBackend for RustlsBackend {
    fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
        match &mut self.session {
            Session::Client(conn) => conn.read_tls(rd),
            Session::Server(conn) => conn.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
        match &mut self.session {
            Session::Client(conn) => conn.write_tls(wr),
            Session::Server(conn) => conn.write_tls(wr),
        }
    }

    fn process_packets(&mut self) -> Result<RecordState> {
        let state = match &mut self.session {
            Session::Client(conn) => conn.process_new_packets()?,
            Session::Server(conn) => conn.process_new_packets()?,
        };
        Ok(RecordState {
            plaintext_bytes: state.plaintext_bytes_to_read(),
            peer_has_closed: state.peer_has_closed(),
        })
    }

    fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.session {
            Session::Client(conn) => conn.reader().read(buf),
            Session::Server(conn) => conn.reader().read(buf),
        }
    }

    fn write_plaintext(&mut self, data: &[u8]) -> io::Result<usize> {
        match &mut self.session {
            Session::Client(conn) => conn.writer().write(data),
            Session::Server(conn) => conn.writer().write(data),
        }
    }

    fn wants_read(&self) -> bool {
        match &self.session {
            Session::Client(conn) => conn.wants_read(),
            Session::Server(conn) => conn.wants_read(),
        }
    }

    fn wants_write(&self) -> bool {
        match &self.session {
            Session::Client(conn) => conn.wants_write(),
            Session::Server(conn) => conn.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match &self.session {
            Session::Client(conn) => conn.is_handshaking(),
            Session::Server(conn) => conn.is_handshaking(),
        }
    }

    fn peer_certificates(&self) -> Vec<CertificateDer<'static>> {
        let certs = match &self.session {
            Session::Client(conn) => conn.peer_certificates(),
            Session::Server(conn) => conn.peer_certificates(),
        };
        certs
            .map(|chain| chain.iter().map(|c| c.clone().into_owned()).collect())
            .unwrap_or_default()
    }

    fn alpn_protocol(&self) -> Option<Vec<u8>> {
        match &self.session {
            Session::Client(conn) => conn.alpn_protocol().map(<[u8]>::to_vec),
            Session::Server(conn) => conn.alpn_protocol().map(<[u8]>::to_vec),
        }
    }

    fn protocol_version(&self) -> Option<TlsVersion> {
        let version = match &self.session {
            Session::Client(conn) => conn.protocol_version(),
            Session::Server(conn) => conn.protocol_version(),
        };
        version.and_then(TlsVersion::from_rustls)
    }

    fn cipher_suite(&self) -> Option<String> {
        let suite = match &self.session {
            Session::Client(conn) => conn.negotiated_cipher_suite(),
            Session::Server(conn) => conn.negotiated_cipher_suite(),
        };
        suite.map(|s| format!("{:?}", s.suite()))
    }

    fn send_close_notify(&mut self) {
        match &mut self.session {
            Session::Client(conn) => conn.send_close_notify(),
            Session::Server(conn) => conn.send_close_notify(),
        }
    }
}
