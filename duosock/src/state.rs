//! Socket identity and staleness tracking

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static SOCKET_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique socket identifier, used to prefix log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    /// Generate a new unique socket ID
    pub fn new() -> Self {
        Self(SOCKET_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for SocketId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock-{}", self.0)
    }
}

/// Generation counter stamped onto every deferred request
///
/// A result whose stamp no longer matches the engine's current index was
/// issued before a close and is dropped unapplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StateIndex(u64);

impl StateIndex {
    /// Move to the next generation, invalidating every outstanding stamp
    pub fn advance(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }

    /// Check a stamp against the current generation
    pub fn is_current(&self, stamp: StateIndex) -> bool {
        *self == stamp
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StateIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
