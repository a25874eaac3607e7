//! Error types for TLS negotiation

use thiserror::Error;

/// Result type alias for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;

/// Errors that can occur while configuring or running a TLS session
#[derive(Debug, Clone, Error)]
pub enum TlsError {
    /// Settings were invalid or contradictory
    #[error("TLS configuration error: {0}")]
    Config(String),

    /// The backend rejected the handshake or a record
    #[error("TLS handshake failed: {0}")]
    Handshake(#[from] rustls::Error),

    /// The owner rejected the peer's certificate chain
    #[error("peer certificate chain was not trusted")]
    PeerNotTrusted,

    /// The transport closed before the session was established
    #[error("connection closed during TLS negotiation")]
    ClosedAbort,

    /// Transport failure while moving ciphertext
    #[error("TLS I/O error: {0}")]
    Io(String),
}

impl TlsError {
    /// Check if the error was caused by bad settings
    pub fn is_config(&self) -> bool {
        matches!(self, TlsError::Config(_))
    }

    /// Check if the peer was rejected by trust evaluation
    pub fn is_untrusted(&self) -> bool {
        match self {
            TlsError::PeerNotTrusted => true,
            TlsError::Handshake(rustls::Error::InvalidCertificate(_)) => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for TlsError {
    fn from(e: std::io::Error) -> Self {
        TlsError::Io(e.to_string())
    }
}
