//! duo-tls - TLS for duosock sockets
//!
//! Wraps a sans-io TLS backend (rustls with the ring provider) in a small
//! state machine the socket engine can step over its own non-blocking
//! transport:
//! - `TlsSettings`: builder-style, validated configuration (role, versions,
//!   ALPN, cipher suites, certificates, manual trust, session resumption)
//! - `TlsBackend`: the backend seam, with `RustlsBackend` as the default
//! - `SecurityContext`: handshake stepping with the `WouldBlock`,
//!   `PeerAuthCompleted` and `Complete` statuses
//!
//! # Example
//!
//! ```no_run
//! use duo_tls::{HandshakeStatus, SecurityContext, TlsSettings};
//!
//! # fn example(stream: &mut std::net::TcpStream) -> duo_tls::Result<()> {
//! let settings = TlsSettings::builder().alpn_protocol("h2").build()?;
//! let mut ctx = SecurityContext::new(&settings, Some("example.com"))?;
//! while ctx.handshake(stream)? != HandshakeStatus::Complete {}
//! # Ok(())
//! # }
//! ```

mod backend;
mod context;
pub mod error;
mod settings;
mod verify;

pub use backend::{RecordState, RustlsBackend, TlsBackend};
pub use context::{HandshakeStatus, PlaintextRead, SecurityContext};
pub use error::{Result, TlsError};
pub use settings::{TlsRole, TlsSettings, TlsSettingsBuilder, TlsVersion};

pub use rustls_pki_types::{CertificateDer, PrivateKeyDer};
