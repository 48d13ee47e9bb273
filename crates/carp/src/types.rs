//! CARP data types and protocol constants.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

/// CARP protocol version carried in every advertisement
pub const CARP_VERSION: u8 = 2;

/// The only CARP message type
pub const CARP_ADVERTISEMENT: u8 = 1;

/// CARP IP protocol number
pub const CARP_PROTOCOL: u8 = 112;

/// CARP multicast group for IPv4
pub const CARP_MULTICAST_ADDR_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 18);

/// CARP multicast group for IPv6
pub const CARP_MULTICAST_ADDR_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x12);

/// TTL / hop limit of every advertisement sent in multicast mode
pub const CARP_DFLTTL: u8 = 255;

/// Default advertisement base interval (seconds)
pub const CARP_DFLTINTV: u8 = 1;

/// Upper bound of the effective (demoted) skew
pub const CARP_MAXSKEW: i32 = 240;

/// Authentication length field value (in 32-bit words)
pub const CARP_AUTHLEN: u8 = 7;

/// Maximum shared key length in bytes
pub const CARP_KEY_LEN: usize = 20;

/// Consecutive send failures before the node demotes itself
pub const CARP_SENDAD_MAX_ERRORS: u32 = 3;

/// Consecutive send successes needed to undo a send-error demotion
pub const CARP_SENDAD_MIN_SUCCESS: u32 = 3;

/// CARP state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CarpState {
    /// Not running: interface down, no addresses, or protocol disallowed
    Init,
    /// Standing by, waiting for the master to go quiet
    Backup,
    /// Answering for the virtual addresses and advertising
    Master,
}

impl fmt::Display for CarpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CarpState::Init => write!(f, "INIT"),
            CarpState::Backup => write!(f, "BACKUP"),
            CarpState::Master => write!(f, "MASTER"),
        }
    }
}

/// Address family of a virtual or local address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    /// Both families, IPv4 first.
    pub const ALL: [AddressFamily; 2] = [AddressFamily::Inet, AddressFamily::Inet6];

    /// Family of an address.
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::Inet,
            IpAddr::V6(_) => AddressFamily::Inet6,
        }
    }

    /// Multicast group CARP uses for this family.
    pub fn multicast_group(self) -> IpAddr {
        match self {
            AddressFamily::Inet => IpAddr::V4(CARP_MULTICAST_ADDR_V4),
            AddressFamily::Inet6 => IpAddr::V6(CARP_MULTICAST_ADDR_V6),
        }
    }

    /// Unspecified address of this family.
    pub fn unspecified(self) -> IpAddr {
        match self {
            AddressFamily::Inet => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::Inet6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            AddressFamily::Inet => 0,
            AddressFamily::Inet6 => 1,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Inet => write!(f, "inet"),
            AddressFamily::Inet6 => write!(f, "inet6"),
        }
    }
}

/// Identity of a virtual router: its interface plus its VHID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouterKey {
    pub interface: String,
    pub vhid: u8,
}

impl RouterKey {
    pub fn new(interface: impl Into<String>, vhid: u8) -> Self {
        Self {
            interface: interface.into(),
            vhid,
        }
    }
}

impl fmt::Display for RouterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.vhid, self.interface)
    }
}

/// Per virtual router configuration
#[derive(Clone, PartialEq, Eq)]
pub struct RouterConfig {
    /// Virtual Host ID (1-255)
    pub vhid: u8,

    /// Advertisement base interval in seconds (1-255)
    pub advbase: u8,

    /// Advertisement skew in 1/256ths of a second (0-254)
    pub advskew: u8,

    /// Shared secret, identical on every member of the redundancy group
    pub key: Vec<u8>,

    /// Unicast IPv4 peer; multicast is used when unset
    pub peer: Option<Ipv4Addr>,

    /// Unicast IPv6 peer; multicast is used when unset
    pub peer6: Option<Ipv6Addr>,
}

impl fmt::Debug for RouterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterConfig")
            .field("vhid", &self.vhid)
            .field("advbase", &self.advbase)
            .field("advskew", &self.advskew)
            .field("key", &"<redacted>")
            .field("peer", &self.peer)
            .field("peer6", &self.peer6)
            .finish()
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            vhid: 1,
            advbase: CARP_DFLTINTV,
            advskew: 0,
            key: Vec::new(),
            peer: None,
            peer6: None,
        }
    }
}

impl RouterConfig {
    /// Create a configuration for `vhid` with default timing and an empty key.
    pub fn new(vhid: u8) -> Self {
        Self {
            vhid,
            ..Default::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.vhid == 0 {
            return Err("VHID must be between 1 and 255".to_string());
        }

        if self.advbase == 0 {
            return Err("advbase must be between 1 and 255".to_string());
        }

        if self.advskew == u8::MAX {
            return Err("advskew must be below 255".to_string());
        }

        if self.key.len() > CARP_KEY_LEN {
            return Err(format!("key must be at most {} bytes", CARP_KEY_LEN));
        }

        Ok(())
    }

    /// Unicast peer configured for `family`, if any.
    pub fn peer_for(&self, family: AddressFamily) -> Option<IpAddr> {
        match family {
            AddressFamily::Inet => self.peer.map(IpAddr::V4),
            AddressFamily::Inet6 => self.peer6.map(IpAddr::V6),
        }
    }

    /// Master_Down interval: three base intervals plus the configured skew.
    pub fn master_down_interval(&self) -> Duration {
        advertisement_interval(3 * u32::from(self.advbase), self.advskew)
    }
}

/// Interval described by a base (seconds) and a skew (1/256ths of a second).
///
/// Lower intervals mean higher priority. The microsecond part is truncated
/// the same way every CARP peer truncates it.
pub fn advertisement_interval(advbase: u32, advskew: u8) -> Duration {
    Duration::from_secs(u64::from(advbase))
        + Duration::from_micros(u64::from(advskew) * 1_000_000 / 256)
}

/// Virtual MAC address of a VHID (`00:00:5e:00:01:<vhid>`).
pub fn virtual_mac(vhid: u8) -> [u8; 6] {
    [0x00, 0x00, 0x5e, 0x00, 0x01, vhid]
}

/// Addresses of one virtual router, ordered by value (IPv4 before IPv6).
pub type AddressSet = BTreeSet<IpAddr>;

/// Per virtual router statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    /// Number of transitions to Master state
    pub master_transitions: u64,

    /// Number of transitions to Backup state
    pub backup_transitions: u64,

    /// Advertisements handed to the transport successfully
    pub adverts_sent: u64,

    /// Advertisement sends that failed
    pub send_errors: u64,

    /// Authenticated advertisements received
    pub adverts_received: u64,

    /// Advertisements rejected by the HMAC check
    pub bad_auth: u64,

    /// Advertisements dropped because they came from one of our own addresses
    pub own_packets: u64,
}

/// Snapshot of a virtual router as seen by the control surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CarpStatus {
    pub interface: String,
    pub vhid: u8,
    pub state: CarpState,
    pub advbase: u8,
    pub advskew: u8,
    /// Skew actually advertised, with the global demotion applied
    pub effective_advskew: u8,
    pub addresses: Vec<Ipv4Addr>,
    pub addresses6: Vec<Ipv6Addr>,
    /// Only present for privileged callers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<Vec<u8>>,
    pub peer: Option<Ipv4Addr>,
    pub peer6: Option<Ipv6Addr>,
    pub stats: RouterStats,
}

/// State change notification published by every virtual router
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateEvent {
    pub interface: String,
    pub vhid: u8,
    pub from: CarpState,
    pub to: CarpState,
    pub reason: String,
}
