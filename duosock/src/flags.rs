//! Lifecycle flags and configuration options for both engines

use std::fmt;

/// Flag and option bit constants
pub mod consts {
    /// connect() or an adopted stream has started the socket
    pub const STARTED: u32 = 1 << 0;
    /// Address resolution or a connect attempt is in progress
    pub const CONNECTING: u32 = 1 << 1;
    /// One address family won the race
    pub const CONNECTED: u32 = 1 << 2;
    /// TLS negotiation completed
    pub const SECURE: u32 = 1 << 3;
    /// New reads/writes (TCP) or sends/receives (UDP) are dropped
    pub const FORBID_IO: u32 = 1 << 4;
    /// Close once the read queue drains
    pub const DISCONNECT_AFTER_READS: u32 = 1 << 5;
    /// Close once the write queue drains
    pub const DISCONNECT_AFTER_WRITES: u32 = 1 << 6;
    /// The peer sent EOF
    pub const READ_EOF: u32 = 1 << 7;
    /// Half-duplex: the read side is finished, writes continue
    pub const READ_STREAM_CLOSED: u32 = 1 << 8;
    /// The current read waits for a timeout extension
    pub const READS_PAUSED: u32 = 1 << 9;
    /// The current write waits for a timeout extension
    pub const WRITES_PAUSED: u32 = 1 << 10;
    /// start_tls() was called
    pub const QUEUED_TLS: u32 = 1 << 11;
    /// The TLS marker reached the head of the read queue
    pub const STARTING_READ_TLS: u32 = 1 << 12;
    /// The TLS marker reached the head of the write queue
    pub const STARTING_WRITE_TLS: u32 = 1 << 13;
    /// The socket was torn down
    pub const CLOSED: u32 = 1 << 14;

    /// UDP: the IPv4 socket exists
    pub const DID_CREATE_IPV4: u32 = 1 << 16;
    /// UDP: the IPv6 socket exists
    pub const DID_CREATE_IPV6: u32 = 1 << 17;
    /// UDP: bind succeeded
    pub const DID_BIND: u32 = 1 << 18;
    /// UDP: deliver one datagram, then stop
    pub const RECEIVE_ONCE: u32 = 1 << 19;
    /// UDP: deliver datagrams until paused
    pub const RECEIVE_CONTINUOUS: u32 = 1 << 20;
    /// UDP: IPv4 is gone for the rest of the socket's life
    pub const IPV4_DEACTIVATED: u32 = 1 << 21;
    /// UDP: IPv6 is gone for the rest of the socket's life
    pub const IPV6_DEACTIVATED: u32 = 1 << 22;
    /// UDP: close once the send queue drains
    pub const CLOSE_AFTER_SENDS: u32 = 1 << 23;
    /// UDP: receive from IPv6 first on the next pass
    pub const FLIP_FLOP: u32 = 1 << 24;

    pub const IPV4_DISABLED: u8 = 0x01;
    pub const IPV6_DISABLED: u8 = 0x02;
    pub const PREFER_IPV4: u8 = 0x04;
    pub const PREFER_IPV6: u8 = 0x08;
    pub const ALLOW_HALF_DUPLEX: u8 = 0x10;
}

const FLAG_NAMES: &[(u32, &str)] = &[
    (consts::STARTED, "STARTED"),
    (consts::CONNECTING, "CONNECTING"),
    (consts::CONNECTED, "CONNECTED"),
    (consts::SECURE, "SECURE"),
    (consts::FORBID_IO, "FORBID_IO"),
    (consts::DISCONNECT_AFTER_READS, "DISCONNECT_AFTER_READS"),
    (consts::DISCONNECT_AFTER_WRITES, "DISCONNECT_AFTER_WRITES"),
    (consts::READ_EOF, "READ_EOF"),
    (consts::READ_STREAM_CLOSED, "READ_STREAM_CLOSED"),
    (consts::READS_PAUSED, "READS_PAUSED"),
    (consts::WRITES_PAUSED, "WRITES_PAUSED"),
    (consts::QUEUED_TLS, "QUEUED_TLS"),
    (consts::STARTING_READ_TLS, "STARTING_READ_TLS"),
    (consts::STARTING_WRITE_TLS, "STARTING_WRITE_TLS"),
    (consts::CLOSED, "CLOSED"),
    (consts::DID_CREATE_IPV4, "DID_CREATE_IPV4"),
    (consts::DID_CREATE_IPV6, "DID_CREATE_IPV6"),
    (consts::DID_BIND, "DID_BIND"),
    (consts::RECEIVE_ONCE, "RECEIVE_ONCE"),
    (consts::RECEIVE_CONTINUOUS, "RECEIVE_CONTINUOUS"),
    (consts::IPV4_DEACTIVATED, "IPV4_DEACTIVATED"),
    (consts::IPV6_DEACTIVATED, "IPV6_DEACTIVATED"),
    (consts::CLOSE_AFTER_SENDS, "CLOSE_AFTER_SENDS"),
    (consts::FLIP_FLOP, "FLIP_FLOP"),
];

/// Socket lifecycle flags
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct SocketFlags(pub u32);

impl SocketFlags {
    pub const STARTED: Self = Self(consts::STARTED);
    pub const CONNECTING: Self = Self(consts::CONNECTING);
    pub const CONNECTED: Self = Self(consts::CONNECTED);
    pub const SECURE: Self = Self(consts::SECURE);
    pub const FORBID_IO: Self = Self(consts::FORBID_IO);
    pub const DISCONNECT_AFTER_READS: Self = Self(consts::DISCONNECT_AFTER_READS);
    pub const DISCONNECT_AFTER_WRITES: Self = Self(consts::DISCONNECT_AFTER_WRITES);
    pub const READ_EOF: Self = Self(consts::READ_EOF);
    pub const READ_STREAM_CLOSED: Self = Self(consts::READ_STREAM_CLOSED);
    pub const READS_PAUSED: Self = Self(consts::READS_PAUSED);
    pub const WRITES_PAUSED: Self = Self(consts::WRITES_PAUSED);
    pub const QUEUED_TLS: Self = Self(consts::QUEUED_TLS);
    pub const STARTING_READ_TLS: Self = Self(consts::STARTING_READ_TLS);
    pub const STARTING_WRITE_TLS: Self = Self(consts::STARTING_WRITE_TLS);
    pub const CLOSED: Self = Self(consts::CLOSED);
    pub const DID_CREATE_IPV4: Self = Self(consts::DID_CREATE_IPV4);
    pub const DID_CREATE_IPV6: Self = Self(consts::DID_CREATE_IPV6);
    pub const DID_BIND: Self = Self(consts::DID_BIND);
    pub const RECEIVE_ONCE: Self = Self(consts::RECEIVE_ONCE);
    pub const RECEIVE_CONTINUOUS: Self = Self(consts::RECEIVE_CONTINUOUS);
    pub const IPV4_DEACTIVATED: Self = Self(consts::IPV4_DEACTIVATED);
    pub const IPV6_DEACTIVATED: Self = Self(consts::IPV6_DEACTIVATED);
    pub const CLOSE_AFTER_SENDS: Self = Self(consts::CLOSE_AFTER_SENDS);
    pub const FLIP_FLOP: Self = Self(consts::FLIP_FLOP);

    /// No flags set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Check if every bit of `other` is set
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check if any bit of `other` is set
    pub const fn intersects(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: Self, on: bool) {
        if on {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }

    /// Get raw value
    pub const fn bits(&self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for SocketFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for SocketFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = FLAG_NAMES
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| *name)
            .collect();

        if parts.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", parts.join("|"))
        }
    }
}

impl fmt::Display for SocketFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Address-family and stream configuration options
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Options(pub u8);

impl Options {
    pub const IPV4_DISABLED: Self = Self(consts::IPV4_DISABLED);
    pub const IPV6_DISABLED: Self = Self(consts::IPV6_DISABLED);
    pub const PREFER_IPV4: Self = Self(consts::PREFER_IPV4);
    pub const PREFER_IPV6: Self = Self(consts::PREFER_IPV6);
    pub const ALLOW_HALF_DUPLEX: Self = Self(consts::ALLOW_HALF_DUPLEX);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: Self, on: bool) {
        if on {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }

    /// Check if IPv4 is allowed by configuration
    pub const fn ipv4_enabled(&self) -> bool {
        self.0 & consts::IPV4_DISABLED == 0
    }

    /// Check if IPv6 is allowed by configuration
    pub const fn ipv6_enabled(&self) -> bool {
        self.0 & consts::IPV6_DISABLED == 0
    }

    /// Check if both families are turned off
    pub const fn both_disabled(&self) -> bool {
        !self.ipv4_enabled() && !self.ipv6_enabled()
    }

    /// Enable or disable IPv4
    pub fn set_ipv4_enabled(&mut self, enabled: bool) {
        self.set(Self::IPV4_DISABLED, !enabled);
    }

    /// Enable or disable IPv6
    pub fn set_ipv6_enabled(&mut self, enabled: bool) {
        self.set(Self::IPV6_DISABLED, !enabled);
    }

    /// Prefer IPv4 when both families resolve; clears the IPv6 preference
    pub fn set_prefer_ipv4(&mut self) {
        self.set(Self::PREFER_IPV6, false);
        self.set(Self::PREFER_IPV4, true);
    }

    /// Prefer IPv6 when both families resolve; clears the IPv4 preference
    pub fn set_prefer_ipv6(&mut self) {
        self.set(Self::PREFER_IPV4, false);
        self.set(Self::PREFER_IPV6, true);
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if self.contains(Self::IPV4_DISABLED) {
            parts.push("IPV4_DISABLED");
        }
        if self.contains(Self::IPV6_DISABLED) {
            parts.push("IPV6_DISABLED");
        }
        if self.contains(Self::PREFER_IPV4) {
            parts.push("PREFER_IPV4");
        }
        if self.contains(Self::PREFER_IPV6) {
            parts.push("PREFER_IPV6");
        }
        if self.contains(Self::ALLOW_HALF_DUPLEX) {
            parts.push("ALLOW_HALF_DUPLEX");
        }

        if parts.is_empty() {
            write!(f, "DEFAULT")
        } else {
            write!(f, "{}", parts.join("|"))
        }
    }
}

impl fmt::Display for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
