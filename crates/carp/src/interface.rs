//! Link context shared by the virtual routers of one interface.

use crate::transport::NetworkTransport;
use crate::types::AddressFamily;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::warn;

/// A network interface hosting CARP virtual routers.
///
/// Local addresses are kept as an immutable snapshot: writers swap in a new
/// `Arc`, readers clone the current one and never see a partial list.
pub struct Interface {
    name: String,
    up: AtomicBool,
    local: RwLock<Arc<Vec<IpAddr>>>,
    transport: Arc<dyn NetworkTransport>,
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("name", &self.name)
            .field("up", &self.is_up())
            .field("local", &self.local_addresses())
            .finish_non_exhaustive()
    }
}

impl Interface {
    /// Create the link context, seeding link state and addresses from the
    /// transport.
    pub fn new(name: impl Into<String>, transport: Arc<dyn NetworkTransport>) -> Self {
        let name = name.into();
        let local = match transport.local_addresses() {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!(interface = %name, error = %e, "Failed to read interface addresses");
                Vec::new()
            }
        };

        Self {
            up: AtomicBool::new(transport.is_up()),
            local: RwLock::new(Arc::new(local)),
            name,
            transport,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Record the link state. Returns true if it changed.
    pub fn set_up(&self, up: bool) -> bool {
        self.up.swap(up, Ordering::AcqRel) != up
    }

    pub fn transport(&self) -> &Arc<dyn NetworkTransport> {
        &self.transport
    }

    /// Current snapshot of the interface's own addresses.
    pub fn local_addresses(&self) -> Arc<Vec<IpAddr>> {
        self.local
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the address snapshot.
    pub fn set_local_addresses(&self, addrs: Vec<IpAddr>) {
        *self.local.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(addrs);
    }

    /// Whether `addr` is one of this host's own addresses on the link.
    pub fn is_local(&self, addr: &IpAddr) -> bool {
        self.local_addresses().contains(addr)
    }

    /// Source address for advertisements of `family`. IPv6 prefers a
    /// link-local address.
    pub fn preferred_source(&self, family: AddressFamily) -> Option<IpAddr> {
        let local = self.local_addresses();
        let mut candidates = local.iter().filter(|a| AddressFamily::of(a) == family);

        match family {
            AddressFamily::Inet => candidates.next().copied(),
            AddressFamily::Inet6 => {
                let all: Vec<&IpAddr> = candidates.collect();
                all.iter()
                    .find(|a| is_link_local_v6(a))
                    .or_else(|| all.first())
                    .map(|a| **a)
            }
        }
    }
}

fn is_link_local_v6(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V6(a) => (a.segments()[0] & 0xffc0) == 0xfe80,
        IpAddr::V4(_) => false,
    }
}
