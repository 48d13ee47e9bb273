//! Raw IP protocol 112 sockets for CARP advertisements.
//!
//! One socket per address family and interface. Sockets are bound to the
//! device, send with TTL / hop limit 255 and report the TTL of received
//! datagrams so the receiver can enforce it.

use crate::transport::{InboundFrame, OutboundPacket};
use crate::types::{
    AddressFamily, CARP_DFLTTL, CARP_MULTICAST_ADDR_V4, CARP_MULTICAST_ADDR_V6, CARP_PROTOCOL,
};
use bytes::Bytes;
use socket2::{Domain, InterfaceIndexOrAddress, Protocol, Socket, Type};
use std::io::{self, ErrorKind, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsRawFd;
use tokio::io::unix::AsyncFd;

const RECV_BUFFER_LEN: usize = 1500;
const IPV4_HEADER_MIN: usize = 20;

/// CARP socket for one family on one interface
pub struct CarpSocket {
    fd: AsyncFd<Socket>,
    family: AddressFamily,
    ifindex: u32,
}

impl CarpSocket {
    /// Open a raw CARP socket bound to `interface`.
    ///
    /// Requires CAP_NET_RAW and a running Tokio runtime.
    pub fn new(interface: &str, family: AddressFamily) -> io::Result<Self> {
        let ifindex = interface_index(interface)?;
        let domain = match family {
            AddressFamily::Inet => Domain::IPV4,
            AddressFamily::Inet6 => Domain::IPV6,
        };

        let socket = Socket::new(
            domain,
            Type::RAW,
            Some(Protocol::from(i32::from(CARP_PROTOCOL))),
        )?;
        socket.set_nonblocking(true)?;
        socket.bind_device(Some(interface.as_bytes()))?;

        match family {
            AddressFamily::Inet => {
                set_int_option(&socket, libc::IPPROTO_IP, libc::IP_TTL, i32::from(CARP_DFLTTL))?;
                socket.set_multicast_ttl_v4(u32::from(CARP_DFLTTL))?;
                socket.set_multicast_loop_v4(false)?;
                set_multicast_if_v4(&socket, ifindex)?;
            }
            AddressFamily::Inet6 => {
                socket.set_unicast_hops_v6(u32::from(CARP_DFLTTL))?;
                socket.set_multicast_hops_v6(u32::from(CARP_DFLTTL))?;
                socket.set_multicast_loop_v6(false)?;
                socket.set_multicast_if_v6(ifindex)?;
                set_int_option(&socket, libc::IPPROTO_IPV6, libc::IPV6_RECVHOPLIMIT, 1)?;
                set_int_option(&socket, libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO, 1)?;
            }
        }

        Ok(Self {
            fd: AsyncFd::new(socket)?,
            family,
            ifindex,
        })
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Join the CARP multicast group on the bound interface.
    pub fn join_multicast(&self) -> io::Result<()> {
        let socket = self.fd.get_ref();
        match self.family {
            AddressFamily::Inet => socket.join_multicast_v4_n(
                &CARP_MULTICAST_ADDR_V4,
                &InterfaceIndexOrAddress::Index(self.ifindex),
            ),
            AddressFamily::Inet6 => socket.join_multicast_v6(&CARP_MULTICAST_ADDR_V6, self.ifindex),
        }
    }

    /// Leave the CARP multicast group.
    pub fn leave_multicast(&self) -> io::Result<()> {
        let socket = self.fd.get_ref();
        match self.family {
            AddressFamily::Inet => socket.leave_multicast_v4_n(
                &CARP_MULTICAST_ADDR_V4,
                &InterfaceIndexOrAddress::Index(self.ifindex),
            ),
            AddressFamily::Inet6 => {
                socket.leave_multicast_v6(&CARP_MULTICAST_ADDR_V6, self.ifindex)
            }
        }
    }

    /// Send one advertisement. The kernel builds the IP header. IPv4 uses
    /// the source address the kernel picks on the bound interface; IPv6
    /// passes the packet's source in `IPV6_PKTINFO`.
    pub fn send(&self, packet: &OutboundPacket) -> io::Result<()> {
        if packet.family != self.family {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("{} packet on {} socket", packet.family, self.family),
            ));
        }

        let sent = match (packet.src, packet.dst) {
            (IpAddr::V6(src), IpAddr::V6(dst)) => self.send_v6(&packet.payload, src, dst)?,
            _ => {
                let dst = SocketAddr::new(packet.dst, 0);
                self.fd.get_ref().send_to(&packet.payload, &dst.into())?
            }
        };
        if sent != packet.payload.len() {
            return Err(io::Error::new(ErrorKind::WriteZero, "short advertisement write"));
        }
        Ok(())
    }

    fn send_v6(&self, payload: &[u8], src: Ipv6Addr, dst: Ipv6Addr) -> io::Result<usize> {
        // SAFETY: sockaddr_in6 and msghdr are plain C structs; all-zero is valid
        let mut name: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
        name.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        name.sin6_addr.s6_addr = dst.octets();
        // Only consulted by the kernel for link-scoped destinations
        name.sin6_scope_id = self.ifindex;

        let mut iov = libc::iovec {
            iov_base: payload.as_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };
        let mut control = [0u64; PKTINFO_CONTROL_WORDS];
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = &mut name as *mut _ as *mut libc::c_void;
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        write_pktinfo(&mut msg, &mut control, src, self.ifindex);

        let sent = unsafe { libc::sendmsg(self.fd.get_ref().as_raw_fd(), &msg, 0) };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(sent as usize)
    }

    /// Wait for the next datagram.
    pub async fn recv(&self) -> io::Result<InboundFrame> {
        loop {
            let mut guard = self.fd.readable().await?;
            let result = guard.try_io(|inner| match self.family {
                AddressFamily::Inet => recv_v4(inner.get_ref()),
                AddressFamily::Inet6 => recv_v6(inner.get_ref()),
            });
            match result {
                Ok(frame) => return frame,
                Err(_would_block) => continue,
            }
        }
    }
}

impl Drop for CarpSocket {
    fn drop(&mut self) {
        // Best effort, the kernel drops membership with the socket anyway
        let _ = self.leave_multicast();
    }
}

/// IPv4 raw sockets deliver the IP header; take TTL and addresses from it.
fn recv_v4(socket: &Socket) -> io::Result<InboundFrame> {
    let mut buf = [0u8; RECV_BUFFER_LEN];
    let mut reader = socket;
    let len = reader.read(&mut buf)?;
    parse_ipv4(&buf[..len])
}

fn parse_ipv4(datagram: &[u8]) -> io::Result<InboundFrame> {
    if datagram.len() < IPV4_HEADER_MIN {
        return Err(io::Error::new(ErrorKind::InvalidData, "truncated IPv4 header"));
    }
    let ihl = usize::from(datagram[0] & 0x0f) * 4;
    if ihl < IPV4_HEADER_MIN || datagram.len() < ihl {
        return Err(io::Error::new(ErrorKind::InvalidData, "bad IPv4 header length"));
    }

    Ok(InboundFrame {
        src: IpAddr::V4(Ipv4Addr::new(datagram[12], datagram[13], datagram[14], datagram[15])),
        dst: IpAddr::V4(Ipv4Addr::new(datagram[16], datagram[17], datagram[18], datagram[19])),
        ttl: datagram[8],
        payload: Bytes::copy_from_slice(&datagram[ihl..]),
    })
}

/// IPv6 raw sockets strip the header; hop limit and destination come from
/// ancillary data.
fn recv_v6(socket: &Socket) -> io::Result<InboundFrame> {
    let mut buf = [0u8; RECV_BUFFER_LEN];
    let mut control = [0u8; 128];
    // SAFETY: sockaddr_in6 and msghdr are plain C structs; all-zero is valid
    let mut name: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = &mut name as *mut _ as *mut libc::c_void;
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = control.len() as _;

    let len = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, 0) };
    if len < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut ttl = 0u8;
    let mut dst = IpAddr::V6(CARP_MULTICAST_ADDR_V6);
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            if hdr.cmsg_level == libc::IPPROTO_IPV6 {
                let data = libc::CMSG_DATA(cmsg);
                match hdr.cmsg_type {
                    libc::IPV6_HOPLIMIT => {
                        let hops = std::ptr::read_unaligned(data as *const libc::c_int);
                        ttl = u8::try_from(hops).unwrap_or(0);
                    }
                    libc::IPV6_PKTINFO => {
                        let info = std::ptr::read_unaligned(data as *const libc::in6_pktinfo);
                        dst = IpAddr::V6(Ipv6Addr::from(info.ipi6_addr.s6_addr));
                    }
                    _ => {}
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(InboundFrame {
        src: IpAddr::V6(Ipv6Addr::from(name.sin6_addr.s6_addr)),
        dst,
        ttl,
        payload: Bytes::copy_from_slice(&buf[..len as usize]),
    })
}

/// Room for one `in6_pktinfo` control message, 8-byte aligned.
const PKTINFO_CONTROL_WORDS: usize = 8;

/// Attach an `IPV6_PKTINFO` control message selecting `src` and `ifindex`.
/// An unspecified `src` leaves source selection to the kernel.
fn write_pktinfo(
    msg: &mut libc::msghdr,
    control: &mut [u64; PKTINFO_CONTROL_WORDS],
    src: Ipv6Addr,
    ifindex: u32,
) {
    let info = libc::in6_pktinfo {
        ipi6_addr: libc::in6_addr {
            s6_addr: src.octets(),
        },
        ipi6_ifindex: ifindex,
    };
    let info_len = std::mem::size_of::<libc::in6_pktinfo>() as libc::c_uint;

    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    // SAFETY: the control buffer is aligned for cmsghdr and large enough for
    // CMSG_SPACE(sizeof(in6_pktinfo))
    unsafe {
        msg.msg_controllen = libc::CMSG_SPACE(info_len) as _;
        let cmsg = libc::CMSG_FIRSTHDR(msg);
        (*cmsg).cmsg_level = libc::IPPROTO_IPV6;
        (*cmsg).cmsg_type = libc::IPV6_PKTINFO;
        (*cmsg).cmsg_len = libc::CMSG_LEN(info_len) as _;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut libc::in6_pktinfo, info);
    }
}

fn set_int_option(
    socket: &Socket,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    unsafe {
        if libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn set_multicast_if_v4(socket: &Socket, ifindex: u32) -> io::Result<()> {
    let mreq = libc::ip_mreqn {
        imr_multiaddr: libc::in_addr { s_addr: 0 },
        imr_address: libc::in_addr { s_addr: 0 },
        imr_ifindex: ifindex as i32,
    };

    unsafe {
        if libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MULTICAST_IF,
            &mreq as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::ip_mreqn>() as libc::socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Get the interface index for a given interface name
pub fn interface_index(name: &str) -> io::Result<u32> {
    use std::ffi::CString;

    let c_name = CString::new(name).map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };

    if index == 0 {
        Err(io::Error::new(
            ErrorKind::NotFound,
            format!("Interface {} not found", name),
        ))
    } else {
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_index() {
        // "lo" (loopback) should always exist
        assert!(interface_index("lo").unwrap() > 0);
        assert!(interface_index("nonexistent99").is_err());
    }

    #[test]
    fn test_parse_ipv4_envelope() {
        let mut datagram = vec![
            0x45, 0x00, 0x00, 0x38, 0x00, 0x00, 0x00, 0x00, 0xff, 0x70, 0x00, 0x00, 192, 0, 2,
            20, 224, 0, 0, 18,
        ];
        datagram.extend_from_slice(&[0xAA; 36]);

        let frame = parse_ipv4(&datagram).unwrap();
        assert_eq!(frame.src, "192.0.2.20".parse::<IpAddr>().unwrap());
        assert_eq!(frame.dst, "224.0.0.18".parse::<IpAddr>().unwrap());
        assert_eq!(frame.ttl, 255);
        assert_eq!(frame.payload.len(), 36);
    }

    #[test]
    fn test_parse_ipv4_rejects_bad_ihl() {
        let mut datagram = vec![0u8; 24];
        datagram[0] = 0x4f;
        assert!(parse_ipv4(&datagram).is_err());
        assert!(parse_ipv4(&datagram[..10]).is_err());
    }

    #[test]
    fn test_pktinfo_carries_source_and_interface() {
        let src: Ipv6Addr = "fe80::1".parse().unwrap();
        let mut control = [0u64; PKTINFO_CONTROL_WORDS];
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        write_pktinfo(&mut msg, &mut control, src, 7);

        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            assert!(!cmsg.is_null());
            assert_eq!((*cmsg).cmsg_level, libc::IPPROTO_IPV6);
            assert_eq!((*cmsg).cmsg_type, libc::IPV6_PKTINFO);
            let info =
                std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo);
            assert_eq!(Ipv6Addr::from(info.ipi6_addr.s6_addr), src);
            assert_eq!(info.ipi6_ifindex, 7);
            assert!(libc::CMSG_NXTHDR(&msg, cmsg).is_null());
        }
    }

    #[tokio::test]
    async fn test_socket_creation() {
        // Needs CAP_NET_RAW; only checks that creation does not panic
        let _ = CarpSocket::new("lo", AddressFamily::Inet);
        let _ = CarpSocket::new("lo", AddressFamily::Inet6);
    }
}
