//! Error types for the socket engines

use std::sync::Arc;

use thiserror::Error;

/// Result type alias for socket operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the socket engines
///
/// Cloneable so one failure can be reported to a packet tag and to the
/// close notification.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Invalid or contradictory setup, e.g. both address families disabled
    #[error("bad configuration: {0}")]
    BadConfig(String),

    /// Invalid call arguments
    #[error("bad parameter: {0}")]
    BadParam(String),

    /// No address family connected in time
    #[error("connect operation timed out")]
    ConnectTimeout,

    /// A read did not complete in time
    #[error("read operation timed out")]
    ReadTimeout,

    /// A write did not complete in time
    #[error("write operation timed out")]
    WriteTimeout,

    /// A datagram could not be sent in time
    #[error("send operation timed out")]
    SendTimeout,

    /// The terminator was not found within the maximum length
    #[error("read operation reached set maximum length")]
    ReadMaxedOut,

    /// The peer closed the connection in the middle of an operation
    #[error("socket closed by remote peer")]
    ConnectionClosed,

    /// TLS negotiation or record failure
    #[error("TLS error: {0}")]
    Tls(#[from] duo_tls::TlsError),

    /// Host or interface resolution failed
    #[error("resolution error: {0}")]
    Resolve(#[from] duo_resolve::Error),

    /// Operating system error
    #[error("system error: {0}")]
    System(Arc<std::io::Error>),

    /// Anything else
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Check if the error was raised before any I/O started
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::BadConfig(_) | Error::BadParam(_))
    }

    /// Check if this is one of the operation timeouts
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::ConnectTimeout | Error::ReadTimeout | Error::WriteTimeout | Error::SendTimeout
        )
    }

    /// The OS error kind, for system errors
    pub fn io_kind(&self) -> Option<std::io::ErrorKind> {
        match self {
            Error::System(e) => Some(e.kind()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::System(Arc::new(e))
    }
}
