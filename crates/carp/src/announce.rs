//! Link-layer announcements for newly acquired virtual addresses.
//!
//! IPv4 addresses are announced with a gratuitous ARP request, IPv6 addresses
//! with an unsolicited Neighbor Advertisement (override flag set) to the
//! all-nodes group. Both go out through one `AF_PACKET` socket, which also
//! carries the interface's promiscuous membership.

use crate::packet::checksum;
use bytes::{BufMut, BytesMut};
use socket2::{Domain, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::AsRawFd;

const ETH_P_ARP: u16 = 0x0806;
const ETH_P_IPV6: u16 = 0x86dd;
const BROADCAST_MAC: [u8; 6] = [0xff; 6];
/// Ethernet address of ff02::1
const ALL_NODES_MAC: [u8; 6] = [0x33, 0x33, 0x00, 0x00, 0x00, 0x01];
const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

const ICMPV6_NEIGHBOR_ADVERT: u8 = 136;
const ND_NA_FLAG_OVERRIDE: u32 = 0x2000_0000;
const ND_OPT_TARGET_LINKADDR: u8 = 2;
const IPPROTO_ICMPV6: u8 = 58;

/// Packet socket bound to one interface
pub struct AnnounceSocket {
    socket: Socket,
    ifindex: i32,
}

impl AnnounceSocket {
    pub fn new(ifindex: u32) -> io::Result<Self> {
        let socket = Socket::new(Domain::PACKET, Type::RAW, None)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            ifindex: ifindex as i32,
        })
    }

    /// Announce that `addr` is reachable at `lladdr`.
    pub fn announce(&self, addr: IpAddr, lladdr: [u8; 6]) -> io::Result<()> {
        match addr {
            IpAddr::V4(a) => self.send_frame(&gratuitous_arp(a, lladdr), BROADCAST_MAC, ETH_P_ARP),
            IpAddr::V6(a) => {
                self.send_frame(&unsolicited_na(a, lladdr), ALL_NODES_MAC, ETH_P_IPV6)
            }
        }
    }

    /// Enter or leave promiscuous mode for as long as this socket lives.
    pub fn set_promiscuous(&self, enabled: bool) -> io::Result<()> {
        let mreq = libc::packet_mreq {
            mr_ifindex: self.ifindex,
            mr_type: libc::PACKET_MR_PROMISC as libc::c_ushort,
            mr_alen: 0,
            mr_address: [0; 8],
        };
        let option = if enabled {
            libc::PACKET_ADD_MEMBERSHIP
        } else {
            libc::PACKET_DROP_MEMBERSHIP
        };

        unsafe {
            if libc::setsockopt(
                self.socket.as_raw_fd(),
                libc::SOL_PACKET,
                option,
                &mreq as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
            ) < 0
            {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    fn send_frame(&self, frame: &[u8], dst_mac: [u8; 6], ethertype: u16) -> io::Result<()> {
        // SAFETY: sockaddr_ll is a plain C struct; all-zero is valid
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::c_ushort;
        addr.sll_protocol = ethertype.to_be();
        addr.sll_ifindex = self.ifindex;
        addr.sll_halen = 6;
        addr.sll_addr[..6].copy_from_slice(&dst_mac);

        let sent = unsafe {
            libc::sendto(
                self.socket.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Full Ethernet frame carrying an ARP request for `addr` from `lladdr`.
fn gratuitous_arp(addr: Ipv4Addr, lladdr: [u8; 6]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(42);
    buf.put_slice(&BROADCAST_MAC);
    buf.put_slice(&lladdr);
    buf.put_u16(ETH_P_ARP);

    buf.put_u16(1); // Ethernet
    buf.put_u16(0x0800); // IPv4
    buf.put_u8(6);
    buf.put_u8(4);
    buf.put_u16(1); // request
    buf.put_slice(&lladdr);
    buf.put_slice(&addr.octets());
    buf.put_slice(&[0u8; 6]);
    buf.put_slice(&addr.octets());
    buf.to_vec()
}

/// Full Ethernet frame carrying an unsolicited Neighbor Advertisement.
fn unsolicited_na(target: Ipv6Addr, lladdr: [u8; 6]) -> Vec<u8> {
    let mut icmp = BytesMut::with_capacity(32);
    icmp.put_u8(ICMPV6_NEIGHBOR_ADVERT);
    icmp.put_u8(0);
    icmp.put_u16(0);
    icmp.put_u32(ND_NA_FLAG_OVERRIDE);
    icmp.put_slice(&target.octets());
    icmp.put_u8(ND_OPT_TARGET_LINKADDR);
    icmp.put_u8(1); // length in units of 8 bytes
    icmp.put_slice(&lladdr);

    let mut pseudo = BytesMut::with_capacity(40 + icmp.len());
    pseudo.put_slice(&target.octets());
    pseudo.put_slice(&ALL_NODES.octets());
    pseudo.put_u32(icmp.len() as u32);
    pseudo.put_slice(&[0, 0, 0, IPPROTO_ICMPV6]);
    pseudo.put_slice(&icmp);
    let sum = checksum(&pseudo);
    icmp[2..4].copy_from_slice(&sum.to_be_bytes());

    let mut buf = BytesMut::with_capacity(14 + 40 + icmp.len());
    buf.put_slice(&ALL_NODES_MAC);
    buf.put_slice(&lladdr);
    buf.put_u16(ETH_P_IPV6);

    buf.put_u32(0x6000_0000);
    buf.put_u16(icmp.len() as u16);
    buf.put_u8(IPPROTO_ICMPV6);
    buf.put_u8(255);
    buf.put_slice(&target.octets());
    buf.put_slice(&ALL_NODES.octets());
    buf.put_slice(&icmp);
    buf.to_vec()
}
