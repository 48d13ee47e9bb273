//! Per-interface container of virtual routers.
//!
//! The group owns its routers, demultiplexes inbound advertisements to them
//! and reference-counts the resources they share on the link: multicast
//! membership per address family and promiscuous mode.

use crate::interface::Interface;
use crate::packet::{Advertisement, verify_checksum};
use crate::registry::{CarpStats, GlobalRegistry};
use crate::state_machine::VirtualRouter;
use crate::transport::InboundFrame;
use crate::types::AddressFamily;
use std::collections::HashSet;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct GroupInner {
    /// Insertion order is kept for deterministic iteration
    routers: Vec<Arc<VirtualRouter>>,
    /// Virtual addresses per family across all routers
    naddrs: [usize; 2],
    joined: [bool; 2],
    promisc: bool,
}

/// All virtual routers hosted on one interface
pub struct InterfaceGroup {
    link: Arc<Interface>,
    ctx: Arc<GlobalRegistry>,
    inner: Mutex<GroupInner>,
}

impl std::fmt::Debug for InterfaceGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceGroup")
            .field("interface", &self.link.name())
            .finish_non_exhaustive()
    }
}

impl InterfaceGroup {
    pub fn new(link: Arc<Interface>, ctx: Arc<GlobalRegistry>) -> Self {
        Self {
            link,
            ctx,
            inner: Mutex::new(GroupInner::default()),
        }
    }

    pub fn interface(&self) -> &Arc<Interface> {
        &self.link
    }

    pub fn name(&self) -> &str {
        self.link.name()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.routers.is_empty()
    }

    /// Routers in insertion order.
    pub async fn routers(&self) -> Vec<Arc<VirtualRouter>> {
        self.inner.lock().await.routers.clone()
    }

    pub async fn router(&self, vhid: u8) -> Option<Arc<VirtualRouter>> {
        self.inner
            .lock()
            .await
            .routers
            .iter()
            .find(|r| r.vhid() == vhid)
            .cloned()
    }

    /// Take ownership of a new router. The first router puts the link into
    /// promiscuous mode.
    pub async fn add_router(&self, router: Arc<VirtualRouter>) -> io::Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.routers.iter().any(|r| r.vhid() == router.vhid()) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("vhid {} already exists on {}", router.vhid(), self.name()),
            ));
        }

        if !inner.promisc {
            self.link.transport().set_promiscuous(true)?;
            inner.promisc = true;
        }
        inner.routers.push(router);
        Ok(())
    }

    /// Attach `addr` to `router`, joining the family's multicast group if
    /// this is the first address of that family on the interface.
    pub async fn attach_address(&self, router: &VirtualRouter, addr: IpAddr) -> io::Result<bool> {
        let mut inner = self.inner.lock().await;
        let family = AddressFamily::of(&addr);
        let idx = family.index();

        if !inner.joined[idx] {
            self.link.transport().join_multicast(family)?;
            inner.joined[idx] = true;
        }

        let added = router.attach_address(addr).await;
        if added {
            inner.naddrs[idx] += 1;
        } else if inner.naddrs[idx] == 0 {
            self.leave(&mut inner, family);
        }
        Ok(added)
    }

    /// Detach `addr` from `router`, leaving the multicast group when the
    /// last address of the family goes away.
    pub async fn detach_address(&self, router: &VirtualRouter, addr: IpAddr) -> bool {
        let mut inner = self.inner.lock().await;
        let family = AddressFamily::of(&addr);
        let idx = family.index();

        let removed = router.detach_address(addr).await;
        if removed {
            inner.naddrs[idx] = inner.naddrs[idx].saturating_sub(1);
            if inner.naddrs[idx] == 0 {
                self.leave(&mut inner, family);
            }
        }
        removed
    }

    /// Destroy and drop the router with `vhid`.
    pub async fn remove_router(&self, vhid: u8) -> Option<Arc<VirtualRouter>> {
        let mut inner = self.inner.lock().await;
        let pos = inner.routers.iter().position(|r| r.vhid() == vhid)?;
        let router = inner.routers.remove(pos);

        let addresses = router.addresses().await;
        router.destroy().await;

        for addr in &addresses {
            let idx = AddressFamily::of(addr).index();
            inner.naddrs[idx] = inner.naddrs[idx].saturating_sub(1);
        }
        for family in AddressFamily::ALL {
            if inner.naddrs[family.index()] == 0 {
                self.leave(&mut inner, family);
            }
        }
        if inner.routers.is_empty() {
            self.clear_promiscuous(&mut inner);
        }
        Some(router)
    }

    /// Hand an inbound frame to the router it belongs to.
    ///
    /// Malformed and unmatched frames are counted and dropped.
    pub async fn forward(&self, frame: &InboundFrame) {
        if !self.ctx.allowed() {
            return;
        }

        let stats = self.ctx.stats();
        let family = frame.family();
        match family {
            AddressFamily::Inet => CarpStats::inc(&stats.ipackets),
            AddressFamily::Inet6 => CarpStats::inc(&stats.ipackets6),
        }

        let advert = match Advertisement::decode(&frame.payload) {
            Ok(advert) => advert,
            Err(e) => {
                CarpStats::inc(&stats.badlen);
                debug!(interface = %self.name(), src = %frame.src, error = %e, "Dropping frame");
                return;
            }
        };

        if !verify_checksum(&frame.payload) {
            CarpStats::inc(&stats.badsum);
            debug!(interface = %self.name(), src = %frame.src, "Bad advertisement checksum");
            return;
        }

        let target = {
            let inner = self.inner.lock().await;
            let mut target = None;
            for router in &inner.routers {
                if router.vhid() == advert.vhid && router.serves(family).await {
                    target = Some(router.clone());
                    break;
                }
            }
            target
        };

        match target {
            Some(router) => {
                router
                    .on_advertisement_received(&advert, frame.src, frame.ttl)
                    .await
            }
            None => CarpStats::inc(&stats.badvhid),
        }
    }

    /// Record a link state change and let every router react to it.
    pub async fn set_link_state(&self, up: bool) {
        self.link.set_up(up);
        for router in self.routers().await {
            router.refresh_link_state().await;
        }
    }

    /// Replace the interface's own address list. Virtual addresses that the
    /// host currently carries are not the interface's own and are filtered.
    pub async fn set_local_addresses(&self, addrs: Vec<IpAddr>) {
        let mut virtual_addrs = HashSet::new();
        for router in self.routers().await {
            virtual_addrs.extend(router.addresses().await);
        }

        let local = addrs
            .into_iter()
            .filter(|a| !virtual_addrs.contains(a))
            .collect();
        self.link.set_local_addresses(local);
    }

    /// Destroy every router and release shared link resources.
    pub async fn teardown(&self) {
        let routers = {
            let mut inner = self.inner.lock().await;
            std::mem::take(&mut inner.routers)
        };
        for router in &routers {
            router.destroy().await;
        }

        let mut inner = self.inner.lock().await;
        inner.naddrs = [0, 0];
        for family in AddressFamily::ALL {
            self.leave(&mut inner, family);
        }
        self.clear_promiscuous(&mut inner);
    }

    fn leave(&self, inner: &mut GroupInner, family: AddressFamily) {
        let idx = family.index();
        if !inner.joined[idx] {
            return;
        }
        if let Err(e) = self.link.transport().leave_multicast(family) {
            warn!(interface = %self.name(), %family, error = %e, "Failed to leave multicast group");
        }
        inner.joined[idx] = false;
    }

    fn clear_promiscuous(&self, inner: &mut GroupInner) {
        if !inner.promisc {
            return;
        }
        if let Err(e) = self.link.transport().set_promiscuous(false) {
            warn!(interface = %self.name(), error = %e, "Failed to leave promiscuous mode");
        }
        inner.promisc = false;
    }
}
