//! Boundary between the protocol engine and the host network stack.
//!
//! The engine never touches sockets or routing tables directly. Every side
//! effect goes through a [`NetworkTransport`] owned by the interface, which
//! lets the state machine run unchanged over raw sockets or an in-memory link.

use crate::types::AddressFamily;
use bytes::Bytes;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;

/// An advertisement ready to be wrapped in an IP envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
    pub family: AddressFamily,
    /// Preferred local source address; unspecified lets the stack choose
    pub src: IpAddr,
    /// Multicast group, or the unicast peer when one is configured
    pub dst: IpAddr,
    pub ttl: u8,
    /// Encoded CARP header
    pub payload: Bytes,
}

/// A CARP datagram received on an interface, IP envelope already stripped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub src: IpAddr,
    pub dst: IpAddr,
    /// TTL / hop limit the datagram arrived with
    pub ttl: u8,
    pub payload: Bytes,
}

impl InboundFrame {
    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.src)
    }
}

/// Per-interface network side effects.
///
/// Sends are best effort: an error is recorded by the caller and never retried
/// synchronously. Implementations must not call back into the engine.
#[cfg_attr(test, mockall::automock)]
pub trait NetworkTransport: Send + Sync {
    /// Transmit one advertisement.
    fn send_advertisement(&self, packet: &OutboundPacket) -> io::Result<()>;

    /// Announce that `addr` now lives at `lladdr` (gratuitous ARP or
    /// unsolicited neighbor advertisement).
    fn send_gratuitous(&self, addr: IpAddr, lladdr: [u8; 6]) -> io::Result<()>;

    fn join_multicast(&self, family: AddressFamily) -> io::Result<()>;

    fn leave_multicast(&self, family: AddressFamily) -> io::Result<()>;

    /// Accept frames for virtual MAC addresses.
    fn set_promiscuous(&self, enabled: bool) -> io::Result<()>;

    /// Install a virtual address so the host answers for it.
    fn add_route(&self, addr: IpAddr) -> io::Result<()>;

    /// Withdraw a virtual address.
    fn del_route(&self, addr: IpAddr) -> io::Result<()>;

    /// Whether the link is currently up.
    fn is_up(&self) -> bool;

    /// The interface's own (non-virtual) addresses.
    fn local_addresses(&self) -> io::Result<Vec<IpAddr>>;
}

/// Factory for per-interface transports.
pub trait NetworkProvider: Send + Sync {
    fn open(&self, interface: &str) -> io::Result<Arc<dyn NetworkTransport>>;
}
