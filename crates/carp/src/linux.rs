//! Linux network transport.
//!
//! Each interface gets one raw CARP socket per address family, opened when
//! the first virtual address of that family joins the multicast group. A
//! reader task per socket forwards received datagrams, tagged with the
//! interface name, into a shared channel that the daemon pumps into the
//! control plane.

use crate::announce::AnnounceSocket;
use crate::netlink::AddressNetlink;
use crate::socket::{CarpSocket, interface_index};
use crate::transport::{InboundFrame, NetworkProvider, NetworkTransport, OutboundPacket};
use crate::types::AddressFamily;
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Datagram received on a named interface
pub type TaggedFrame = (String, InboundFrame);

/// Link state and addresses of one interface at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub up: bool,
    pub addresses: Vec<IpAddr>,
    pub hwaddr: Option<[u8; 6]>,
}

/// Read link state and addresses of every interface on the host.
pub fn interface_snapshot() -> io::Result<HashMap<String, LinkSnapshot>> {
    let mut links: HashMap<String, LinkSnapshot> = HashMap::new();
    for ifa in getifaddrs().map_err(io::Error::from)? {
        let entry = links.entry(ifa.interface_name.clone()).or_default();
        entry.up = ifa
            .flags
            .contains(InterfaceFlags::IFF_UP | InterfaceFlags::IFF_RUNNING);

        let Some(address) = ifa.address else {
            continue;
        };
        if let Some(sin) = address.as_sockaddr_in() {
            entry.addresses.push(IpAddr::V4(sin.ip()));
        } else if let Some(sin6) = address.as_sockaddr_in6() {
            entry.addresses.push(IpAddr::V6(sin6.ip()));
        } else if let Some(link) = address.as_link_addr() {
            entry.hwaddr = link.addr();
        }
    }
    Ok(links)
}

fn snapshot_of(interface: &str) -> io::Result<LinkSnapshot> {
    interface_snapshot()?
        .remove(interface)
        .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("Interface {} not found", interface)))
}

/// Provider of [`LinuxTransport`]s sharing one inbound channel
pub struct LinuxNetwork {
    frames: mpsc::Sender<TaggedFrame>,
}

impl LinuxNetwork {
    /// Create the provider and the receiving end of its inbound channel.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TaggedFrame>) {
        let (frames, rx) = mpsc::channel(capacity);
        (Self { frames }, rx)
    }
}

impl NetworkProvider for LinuxNetwork {
    fn open(&self, interface: &str) -> io::Result<Arc<dyn NetworkTransport>> {
        let transport = LinuxTransport::open(interface, self.frames.clone())?;
        Ok(Arc::new(transport))
    }
}

struct Channel {
    socket: Arc<CarpSocket>,
    reader: JoinHandle<()>,
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Raw-socket transport for one interface
pub struct LinuxTransport {
    interface: String,
    ifindex: u32,
    hwaddr: Option<[u8; 6]>,
    frames: mpsc::Sender<TaggedFrame>,
    channels: Mutex<[Option<Channel>; 2]>,
    announce: AnnounceSocket,
    netlink: Mutex<AddressNetlink>,
}

impl LinuxTransport {
    /// Open the packet and netlink sockets for `interface`.
    ///
    /// Requires CAP_NET_RAW and CAP_NET_ADMIN.
    pub fn open(interface: &str, frames: mpsc::Sender<TaggedFrame>) -> io::Result<Self> {
        let ifindex = interface_index(interface)?;
        let hwaddr = snapshot_of(interface)?.hwaddr;
        info!(interface, ifindex, "Opened CARP transport");

        Ok(Self {
            interface: interface.to_string(),
            ifindex,
            hwaddr,
            frames,
            channels: Mutex::new([None, None]),
            announce: AnnounceSocket::new(ifindex)?,
            netlink: Mutex::new(AddressNetlink::new()?),
        })
    }

    fn socket(&self, family: AddressFamily) -> io::Result<Arc<CarpSocket>> {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels[family.index()]
            .as_ref()
            .map(|c| c.socket.clone())
            .ok_or_else(|| {
                io::Error::new(
                    ErrorKind::NotConnected,
                    format!("no {} CARP socket on {}", family, self.interface),
                )
            })
    }

    fn spawn_reader(&self, socket: Arc<CarpSocket>) -> JoinHandle<()> {
        let interface = self.interface.clone();
        let frames = self.frames.clone();
        tokio::spawn(async move {
            loop {
                match socket.recv().await {
                    Ok(frame) => {
                        if frames.send((interface.clone(), frame)).await.is_err() {
                            debug!(interface = %interface, "Inbound channel closed");
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::InvalidData => {
                        debug!(interface = %interface, error = %e, "Dropping malformed datagram");
                    }
                    Err(e) => {
                        warn!(interface = %interface, error = %e, "CARP receive failed");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        })
    }
}

impl NetworkTransport for LinuxTransport {
    fn send_advertisement(&self, packet: &OutboundPacket) -> io::Result<()> {
        self.socket(packet.family)?.send(packet)
    }

    fn send_gratuitous(&self, addr: IpAddr, lladdr: [u8; 6]) -> io::Result<()> {
        // The stack only accepts frames addressed to the interface's own MAC
        self.announce.announce(addr, self.hwaddr.unwrap_or(lladdr))
    }

    fn join_multicast(&self, family: AddressFamily) -> io::Result<()> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if channels[family.index()].is_some() {
            return Ok(());
        }

        let socket = Arc::new(CarpSocket::new(&self.interface, family)?);
        socket.join_multicast()?;
        let reader = self.spawn_reader(socket.clone());
        channels[family.index()] = Some(Channel { socket, reader });
        debug!(interface = %self.interface, %family, "Joined CARP multicast group");
        Ok(())
    }

    fn leave_multicast(&self, family: AddressFamily) -> io::Result<()> {
        let channel = self.channels.lock().unwrap_or_else(PoisonError::into_inner)[family.index()].take();
        if let Some(channel) = channel {
            channel.socket.leave_multicast()?;
            debug!(interface = %self.interface, %family, "Left CARP multicast group");
        }
        Ok(())
    }

    fn set_promiscuous(&self, enabled: bool) -> io::Result<()> {
        self.announce.set_promiscuous(enabled)
    }

    fn add_route(&self, addr: IpAddr) -> io::Result<()> {
        self.netlink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add_address(self.ifindex, addr)
    }

    fn del_route(&self, addr: IpAddr) -> io::Result<()> {
        self.netlink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .del_address(self.ifindex, addr)
    }

    fn is_up(&self) -> bool {
        match snapshot_of(&self.interface) {
            Ok(link) => link.up,
            Err(e) => {
                warn!(interface = %self.interface, error = %e, "Failed to read link state");
                false
            }
        }
    }

    fn local_addresses(&self) -> io::Result<Vec<IpAddr>> {
        Ok(snapshot_of(&self.interface)?.addresses)
    }
}
