//! Error types for address resolution

use thiserror::Error;

/// Result type alias for resolver operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving hosts and interfaces
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The system resolver failed
    #[error("lookup of {host} failed: {reason}")]
    Lookup { host: String, reason: String },

    /// The lookup succeeded but produced nothing usable
    #[error("no addresses found for {0}")]
    NoAddresses(String),

    /// The interface descriptor did not match any local interface
    #[error("unknown interface: {0}")]
    UnknownInterface(String),

    /// A string that had to be a numeric address was not one
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Interface enumeration failed
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Check if the error came from the system resolver rather than bad input
    pub fn is_lookup_failure(&self) -> bool {
        matches!(self, Error::Lookup { .. } | Error::NoAddresses(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
