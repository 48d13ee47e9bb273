//! rtnetlink address management.
//!
//! A master installs its virtual addresses as host routes on the interface
//! (`RTM_NEWADDR`, /32 or /128) so the stack answers for them, and withdraws
//! them (`RTM_DELADDR`) when it stops being master.

use bytes::{BufMut, BytesMut};
use netlink_packet_core::{
    NLM_F_ACK, NLM_F_CREATE, NLM_F_REPLACE, NLM_F_REQUEST, NetlinkDeserializable, NetlinkHeader,
    NetlinkMessage, NetlinkPayload, NetlinkSerializable,
};
use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
use std::io::{self, ErrorKind};
use std::net::IpAddr;
use tracing::{debug, trace};

const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;
const IFA_F_NODAD: u8 = 0x02;
const RT_SCOPE_UNIVERSE: u8 = 0;
const RT_SCOPE_LINK: u8 = 253;
const IFADDRMSG_LEN: usize = 8;
const RTA_HEADER_LEN: usize = 4;

/// An `ifaddrmsg` carrying one address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressMessage {
    add: bool,
    ifindex: u32,
    addr: IpAddr,
}

impl AddressMessage {
    pub fn new(add: bool, ifindex: u32, addr: IpAddr) -> Self {
        Self { add, ifindex, addr }
    }

    fn octets(&self) -> Vec<u8> {
        match self.addr {
            IpAddr::V4(a) => a.octets().to_vec(),
            IpAddr::V6(a) => a.octets().to_vec(),
        }
    }

    fn attribute_len(&self) -> usize {
        (RTA_HEADER_LEN + self.octets().len() + 3) & !3
    }
}

impl NetlinkSerializable for AddressMessage {
    fn message_type(&self) -> u16 {
        if self.add {
            libc::RTM_NEWADDR
        } else {
            libc::RTM_DELADDR
        }
    }

    fn buffer_len(&self) -> usize {
        IFADDRMSG_LEN + 2 * self.attribute_len()
    }

    fn serialize(&self, buffer: &mut [u8]) {
        let octets = self.octets();
        let (family, prefix, scope, flags) = match self.addr {
            IpAddr::V4(_) => (libc::AF_INET as u8, 32u8, RT_SCOPE_UNIVERSE, 0u8),
            IpAddr::V6(a) => {
                let scope = if (a.segments()[0] & 0xffc0) == 0xfe80 {
                    RT_SCOPE_LINK
                } else {
                    RT_SCOPE_UNIVERSE
                };
                (libc::AF_INET6 as u8, 128u8, scope, IFA_F_NODAD)
            }
        };

        let mut buf = BytesMut::with_capacity(self.buffer_len());
        buf.put_u8(family);
        buf.put_u8(prefix);
        buf.put_u8(flags);
        buf.put_u8(scope);
        buf.put_u32_ne(self.ifindex);

        let attr_len = self.attribute_len();
        for kind in [IFA_LOCAL, IFA_ADDRESS] {
            buf.put_u16_ne((RTA_HEADER_LEN + octets.len()) as u16);
            buf.put_u16_ne(kind);
            buf.put_slice(&octets);
            buf.put_bytes(0, attr_len - RTA_HEADER_LEN - octets.len());
        }

        buffer[..buf.len()].copy_from_slice(&buf);
    }
}

impl NetlinkDeserializable for AddressMessage {
    type Error = io::Error;

    fn deserialize(_header: &NetlinkHeader, _payload: &[u8]) -> Result<Self, Self::Error> {
        // The kernel only answers address requests with acks
        Err(io::Error::new(
            ErrorKind::InvalidData,
            "unexpected address message from kernel",
        ))
    }
}

impl From<AddressMessage> for NetlinkPayload<AddressMessage> {
    fn from(message: AddressMessage) -> Self {
        NetlinkPayload::InnerMessage(message)
    }
}

/// Route netlink socket for address changes
pub struct AddressNetlink {
    socket: Socket,
    sequence: u32,
}

impl AddressNetlink {
    pub fn new() -> io::Result<Self> {
        let mut socket = Socket::new(NETLINK_ROUTE)?;
        socket.bind(&SocketAddr::new(0, 0))?;
        socket.connect(&SocketAddr::new(0, 0))?;
        Ok(Self {
            socket,
            sequence: 0,
        })
    }

    /// Install `addr` on `ifindex`. An address that is already present is
    /// not an error.
    pub fn add_address(&mut self, ifindex: u32, addr: IpAddr) -> io::Result<()> {
        debug!(ifindex, %addr, "Adding virtual address");
        match self.request(AddressMessage::new(true, ifindex, addr)) {
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => Ok(()),
            other => other,
        }
    }

    /// Withdraw `addr` from `ifindex`. A missing address is not an error.
    pub fn del_address(&mut self, ifindex: u32, addr: IpAddr) -> io::Result<()> {
        debug!(ifindex, %addr, "Removing virtual address");
        match self.request(AddressMessage::new(false, ifindex, addr)) {
            Err(e) if e.raw_os_error() == Some(libc::EADDRNOTAVAIL) => Ok(()),
            other => other,
        }
    }

    fn request(&mut self, message: AddressMessage) -> io::Result<()> {
        let add = message.add;
        let mut nlmsg = NetlinkMessage::from(message);
        nlmsg.header.flags = NLM_F_REQUEST | NLM_F_ACK;
        if add {
            nlmsg.header.flags |= NLM_F_CREATE | NLM_F_REPLACE;
        }
        self.sequence = self.sequence.wrapping_add(1);
        nlmsg.header.sequence_number = self.sequence;
        nlmsg.finalize();

        let mut buf = vec![0u8; nlmsg.buffer_len()];
        nlmsg.serialize(&mut buf);
        trace!(len = buf.len(), "Sending rtnetlink request");
        self.socket.send(&buf, 0)?;

        let mut reply = vec![0u8; 4096];
        let len = self.socket.recv(&mut &mut reply[..], 0)?;
        let response = NetlinkMessage::<AddressMessage>::deserialize(&reply[..len])
            .map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))?;

        match response.payload {
            NetlinkPayload::Error(err) => match err.code {
                None => Ok(()),
                Some(code) => Err(io::Error::from_raw_os_error(-code.get())),
            },
            _ => Ok(()),
        }
    }
}
