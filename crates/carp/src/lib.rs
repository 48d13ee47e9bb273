//! Common Address Redundancy Protocol (CARP)
//!
//! Pure Rust implementation of CARP version 2 for sharing IPv4 and IPv6
//! addresses between hosts on one link.
//!
//! # Features
//!
//! - Advertisement codec with the Internet checksum
//! - HMAC-SHA1 authentication over the virtual address set
//! - INIT/BACKUP/MASTER state machine with advbase/advskew timing
//! - Preemption, global demotion and send-error demotion
//! - Transport abstraction with a raw socket backend for Linux
//!
//! # Example
//!
//! ```no_run
//! use carp::{CarpRequest, ControlPlane, GlobalConfig, GlobalRegistry, LinuxNetwork};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (network, mut frames) = LinuxNetwork::new(1024);
//! let control = Arc::new(ControlPlane::new(
//!     GlobalRegistry::new(GlobalConfig::default()),
//!     Arc::new(network),
//! ));
//!
//! // Create vhid 1 on eth0 (requires CAP_NET_RAW and CAP_NET_ADMIN)
//! control
//!     .set(
//!         "eth0",
//!         1,
//!         CarpRequest {
//!             advskew: Some(100),
//!             key: Some(b"secret".to_vec()),
//!             addresses: vec!["192.168.1.1".parse()?],
//!             ..Default::default()
//!         },
//!     )
//!     .await?;
//!
//! while let Some((interface, frame)) = frames.recv().await {
//!     control.input(&interface, &frame).await;
//! }
//! # Ok(())
//! # }
//! ```

mod auth;
mod control;
mod group;
mod interface;
mod packet;
mod registry;
mod state_machine;
mod transport;
mod types;

#[cfg(target_os = "linux")]
mod announce;
#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
mod netlink;
#[cfg(target_os = "linux")]
mod socket;

pub use auth::{AuthEngine, canonical_order};
pub use control::{CarpRequest, ControlError, ControlPlane};
pub use group::InterfaceGroup;
pub use interface::Interface;
pub use packet::{Advertisement, CARP_HEADER_LEN, DecodeError, checksum, verify_checksum};
pub use registry::{CarpStats, GlobalConfig, GlobalRegistry, LogLevel, StatsSnapshot};
pub use state_machine::VirtualRouter;
pub use transport::{InboundFrame, NetworkProvider, NetworkTransport, OutboundPacket};
pub use types::{
    AddressFamily, AddressSet, CARP_DFLTTL, CARP_KEY_LEN, CARP_MAXSKEW, CARP_MULTICAST_ADDR_V4,
    CARP_MULTICAST_ADDR_V6, CARP_PROTOCOL, CARP_VERSION, CarpState, CarpStatus, RouterConfig,
    RouterKey, RouterStats, StateEvent, advertisement_interval, virtual_mac,
};

#[cfg(target_os = "linux")]
pub use linux::{LinkSnapshot, LinuxNetwork, LinuxTransport, TaggedFrame, interface_snapshot};
#[cfg(target_os = "linux")]
pub use socket::CarpSocket;
