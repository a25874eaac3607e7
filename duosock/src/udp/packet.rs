//! Send-queue entries and destination selection

use std::net::SocketAddr;
use std::time::Duration;

use duo_resolve::ResolvedAddresses;

use crate::error::{Error, Result};
use crate::flags::{Options, SocketFlags};
use crate::socket::Family;
use crate::Tag;

/// Where a queued packet is going
#[derive(Debug)]
pub(crate) enum Target {
    /// The connected peer
    Connected,
    Address(SocketAddr),
    /// A host lookup is in flight
    Resolving,
    Resolved(ResolvedAddresses),
    Failed(Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FilterState {
    Unchecked,
    Pending,
    Passed,
}

#[derive(Debug)]
pub(crate) struct SendPacket {
    pub id: u64,
    pub data: Vec<u8>,
    pub timeout: Option<Duration>,
    pub tag: Tag,
    pub target: Target,
    /// Address picked once the packet reached the head of the queue
    pub dest: Option<SocketAddr>,
    pub filter: FilterState,
}

impl SendPacket {
    pub(crate) fn new(
        id: u64,
        data: Vec<u8>,
        target: Target,
        timeout: Option<Duration>,
        tag: Tag,
    ) -> Self {
        Self {
            id,
            data,
            timeout,
            tag,
            target,
            dest: None,
            filter: FilterState::Unchecked,
        }
    }

    /// Ready for the socket once addressed and past the filter
    pub(crate) fn is_ready(&self) -> bool {
        self.dest.is_some() && self.filter == FilterState::Passed
    }
}

/// Connect request travelling through the send queue
#[derive(Debug)]
pub(crate) struct ConnectPacket {
    pub id: u64,
    pub target: Target,
}

#[derive(Debug)]
pub(crate) enum SendItem {
    Send(SendPacket),
    Connect(ConnectPacket),
}

impl SendItem {
    pub(crate) fn id(&self) -> u64 {
        match self {
            SendItem::Send(p) => p.id,
            SendItem::Connect(p) => p.id,
        }
    }

    pub(crate) fn target_mut(&mut self) -> &mut Target {
        match self {
            SendItem::Send(p) => &mut p.target,
            SendItem::Connect(p) => &mut p.target,
        }
    }
}

/// Check if a family may carry traffic right now
pub(crate) fn family_usable(family: Family, options: Options, flags: SocketFlags) -> bool {
    match family {
        Family::V4 => options.ipv4_enabled() && !flags.contains(SocketFlags::IPV4_DEACTIVATED),
        Family::V6 => options.ipv6_enabled() && !flags.contains(SocketFlags::IPV6_DEACTIVATED),
    }
}

/// Validate a literal destination against the usable families
pub(crate) fn check_address(
    addr: SocketAddr,
    options: Options,
    flags: SocketFlags,
) -> Result<SocketAddr> {
    let family = Family::of(&addr);
    if family_usable(family, options, flags) {
        Ok(addr)
    } else {
        Err(Error::BadConfig(format!(
            "{} is disabled or deactivated, cannot use {}",
            family, addr
        )))
    }
}

/// Choose one resolved address, honouring family preference
///
/// IPv4 wins when both are usable unless IPv6 is preferred.
pub(crate) fn pick_address(
    resolved: &ResolvedAddresses,
    options: Options,
    flags: SocketFlags,
) -> Result<SocketAddr> {
    let v4 = resolved
        .first_v4()
        .filter(|_| family_usable(Family::V4, options, flags))
        .map(SocketAddr::V4);
    let v6 = resolved
        .first_v6()
        .filter(|_| family_usable(Family::V6, options, flags))
        .map(SocketAddr::V6);

    match (v4, v6) {
        (Some(v4), Some(v6)) => {
            if options.contains(Options::PREFER_IPV6) {
                Ok(v6)
            } else {
                Ok(v4)
            }
        }
        (Some(addr), None) | (None, Some(addr)) => Ok(addr),
        (None, None) if resolved.v4.is_empty() => Err(Error::BadConfig(
            "IPv6 is disabled or deactivated and no IPv4 address was found".into(),
        )),
        (None, None) if resolved.v6.is_empty() => Err(Error::BadConfig(
            "IPv4 is disabled or deactivated and no IPv6 address was found".into(),
        )),
        (None, None) => Err(Error::BadConfig(
            "no resolved address is in a usable family".into(),
        )),
    }
}
